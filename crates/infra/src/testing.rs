//! Payloads shared by the crate's unit and integration tests.

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use backlog_core::{Payload, PayloadRegistry, PayloadType};

#[derive(Debug, Serialize, Deserialize)]
pub struct Noop;

#[async_trait]
impl Payload for Noop {
    async fn perform(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl PayloadType for Noop {
    const TYPE_NAME: &'static str = "Noop";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Explode {
    pub message: String,
}

#[async_trait]
impl Payload for Explode {
    async fn perform(&self) -> anyhow::Result<()> {
        Err(anyhow!("disk unplugged")).context(self.message.clone())
    }
}

impl PayloadType for Explode {
    const TYPE_NAME: &'static str = "Explode";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Panicky;

#[async_trait]
impl Payload for Panicky {
    async fn perform(&self) -> anyhow::Result<()> {
        panic!("payload lost its mind");
    }
}

impl PayloadType for Panicky {
    const TYPE_NAME: &'static str = "Panicky";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Sleepy {
    pub millis: u64,
}

#[async_trait]
impl Payload for Sleepy {
    async fn perform(&self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(())
    }
}

impl PayloadType for Sleepy {
    const TYPE_NAME: &'static str = "Sleepy";
}

/// Always fails and gives up after two attempts.
#[derive(Debug, Serialize, Deserialize)]
pub struct Fragile;

#[async_trait]
impl Payload for Fragile {
    async fn perform(&self) -> anyhow::Result<()> {
        Err(anyhow!("still broken"))
    }

    fn display_name(&self) -> Option<String> {
        Some("fragile job".to_string())
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(2)
    }
}

impl PayloadType for Fragile {
    const TYPE_NAME: &'static str = "Fragile";
}

pub fn registry() -> PayloadRegistry {
    let mut registry = PayloadRegistry::new();
    registry
        .register::<Noop>()
        .register::<Explode>()
        .register::<Panicky>()
        .register::<Sleepy>()
        .register::<Fragile>();
    registry
}
