//! Defines the [`CallHandler`], the entry point for answering FastAGI calls.
use crate::{AGIError, Connection};

/// One call script.
///
/// `start_call` is invoked exactly once per incoming connection, after the
/// environment block has been read and the request URL parsed. When it
/// returns — with success or with an error — the connection is finished and
/// asterisk continues in the dialplan.
///
/// Make sure to use `#[async_trait::async_trait]` on your impl block.
#[async_trait::async_trait]
pub trait CallHandler: Send + Sync + std::fmt::Debug {
    async fn start_call(&self, agi: &Connection) -> Result<(), AGIError>;
}

#[async_trait::async_trait]
impl CallHandler for Box<dyn CallHandler> {
    async fn start_call(&self, agi: &Connection) -> Result<(), AGIError> {
        (**self).start_call(agi).await
    }
}

#[async_trait::async_trait]
impl CallHandler for &Box<dyn CallHandler> {
    async fn start_call(&self, agi: &Connection) -> Result<(), AGIError> {
        (**self).start_call(agi).await
    }
}

#[async_trait::async_trait]
impl CallHandler for &dyn CallHandler {
    async fn start_call(&self, agi: &Connection) -> Result<(), AGIError> {
        (**self).start_call(agi).await
    }
}
