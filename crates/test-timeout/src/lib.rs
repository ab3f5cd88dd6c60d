//! `#[test_timeout::timeout]` for synchronous tests and
//! `#[test_timeout::tokio_timeout_test]` for async ones.
//!
//! Both run the body on a dedicated thread and fail the test once the
//! deadline passes. The deadline defaults to 60 seconds, can be given as an
//! integer argument, and is multiplied at runtime by `TEST_TIMEOUT_SCALE`
//! when that variable holds a positive number.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, &[&["tokio", "test"], &["test"]]);
    let body = quote! {
        let runtime = ::tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async move {
            ::tokio::time::timeout(__deadline, async move #block)
                .await
                .unwrap_or_else(|_| panic!("test `{}` timed out after {:?}", __name, __deadline));
        });
    };
    let harness = harness(&sig.ident, timeout_secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test; use tokio_timeout_test for async tests",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, &[&["test"]]);
    let harness = harness(&sig.ident, timeout_secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    })
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Runs `body` on its own thread and waits for it up to the scaled deadline,
/// re-raising any panic from the body on the test thread.
fn harness(name: &Ident, timeout_secs: u64, body: TokenStream2) -> TokenStream2 {
    let name = name.to_string();
    quote! {
        let __name: &'static str = #name;
        let __scale = ::std::env::var("TEST_TIMEOUT_SCALE")
            .ok()
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(1.0);
        let __deadline = ::std::time::Duration::from_secs(#timeout_secs).mul_f64(__scale);
        let (__sender, __receiver) = ::std::sync::mpsc::channel();
        ::std::thread::Builder::new()
            .name(__name.to_string())
            .spawn(move || {
                let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = __sender.send(outcome);
            })
            .expect("failed to spawn test thread");
        match __receiver.recv_timeout(__deadline) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test `{}` timed out after {:?}", __name, __deadline)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test `{}` thread exited without reporting a result", __name)
            }
        }
    }
}

fn strip_attrs(attrs: Vec<Attribute>, paths: &[&[&str]]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !paths
                .iter()
                .any(|path| segments.iter().map(String::as_str).eq(path.iter().copied()))
        })
        .collect()
}
