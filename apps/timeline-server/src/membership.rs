use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::{aio::ConnectionManager, AsyncCommands};
use thiserror::Error;
use timeline_core::ProjectId;

use crate::config::{Grant, MembershipConfig};

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("membership directory unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

/// Answers "may this identity open the timeline of this project".
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    async fn is_member(&self, project: ProjectId, subject: &str) -> Result<bool, MembershipError>;
}

/// In-process membership list, seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticMembership {
    open: bool,
    grants: RwLock<HashSet<(ProjectId, String)>>,
}

impl StaticMembership {
    /// Every authenticated identity is a member of every project.
    pub fn open() -> Self {
        Self {
            open: true,
            grants: RwLock::default(),
        }
    }

    pub fn from_grants(grants: impl IntoIterator<Item = Grant>) -> Self {
        let grants = grants
            .into_iter()
            .map(|grant| (grant.project, grant.subject))
            .collect();
        Self {
            open: false,
            grants: RwLock::new(grants),
        }
    }

    pub fn from_config(config: &MembershipConfig) -> Self {
        if config.open {
            Self::open()
        } else {
            Self::from_grants(config.grants.iter().cloned())
        }
    }

    pub fn grant(&self, project: ProjectId, subject: impl Into<String>) {
        self.grants.write().insert((project, subject.into()));
    }

    pub fn revoke(&self, project: ProjectId, subject: &str) -> bool {
        self.grants.write().remove(&(project, subject.to_string()))
    }
}

#[async_trait]
impl MembershipDirectory for StaticMembership {
    async fn is_member(&self, project: ProjectId, subject: &str) -> Result<bool, MembershipError> {
        if self.open {
            return Ok(true);
        }
        Ok(self.grants.read().contains(&(project, subject.to_string())))
    }
}

/// Membership stored as one Redis set per project.
#[derive(Clone)]
pub struct RedisMembership {
    redis: ConnectionManager,
}

impl RedisMembership {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub fn members_key(project: ProjectId) -> String {
        format!("timeline:project:{}:members", project)
    }

    /// Adds the configured grants to their project sets.
    pub async fn seed(&self, grants: &[Grant]) -> Result<(), MembershipError> {
        let mut conn = self.redis.clone();
        for grant in grants {
            conn.sadd::<_, _, ()>(Self::members_key(grant.project), &grant.subject)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipDirectory for RedisMembership {
    async fn is_member(&self, project: ProjectId, subject: &str) -> Result<bool, MembershipError> {
        let mut conn = self.redis.clone();
        let member: bool = conn.sismember(Self::members_key(project), subject).await?;
        Ok(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn static_grants_are_scoped_per_project() {
        let directory = StaticMembership::from_grants([Grant {
            project: ProjectId(42),
            subject: "alice".into(),
        }]);
        assert!(directory.is_member(ProjectId(42), "alice").await.unwrap());
        assert!(!directory.is_member(ProjectId(7), "alice").await.unwrap());
        assert!(!directory.is_member(ProjectId(42), "bob").await.unwrap());

        directory.grant(ProjectId(42), "bob");
        assert!(directory.is_member(ProjectId(42), "bob").await.unwrap());
        assert!(directory.revoke(ProjectId(42), "bob"));
        assert!(!directory.is_member(ProjectId(42), "bob").await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn open_directory_admits_everyone() {
        let directory = StaticMembership::from_config(&MembershipConfig {
            grants: Vec::new(),
            open: true,
        });
        assert!(directory.is_member(ProjectId(1), "anyone").await.unwrap());
    }

    #[test_timeout::timeout]
    fn redis_key_layout() {
        assert_eq!(
            RedisMembership::members_key(ProjectId(42)),
            "timeline:project:42:members"
        );
    }
}
