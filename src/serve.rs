//! Accept FastAGI connections and dispatch them to a [`CallHandler`].
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agiurl::AGIUrl;
use crate::connection::{drive_session, read_environment, Connection};
use crate::framer::LineFramer;
use crate::handler::CallHandler;
use crate::AGIError;

/// Serve FastAGI requests from the listener with the given handler.
///
/// Every accepted connection runs on its own task: the environment block is
/// read, `agi_request` is parsed, and `start_call` is invoked once. The
/// connection is finished when the handler returns, successfully or not.
///
/// # Errors
/// Returns an error when accepting on the listener fails.
pub async fn serve<H>(listener: TcpListener, handler: H) -> Result<(), AGIError>
where
    H: CallHandler + 'static,
{
    let handler = Arc::new(handler);
    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|_| AGIError::CannotSpawnListener)?;
        debug!("new connection to the fastagi server");
        let our_handler = handler.clone();
        tokio::spawn(async move {
            if let Err(error) = run_session(stream, our_handler).await {
                warn!(%error, "call session aborted");
            }
        });
    }
}

/// Drive one accepted connection from handshake to finish.
async fn run_session<H>(mut stream: TcpStream, handler: Arc<H>) -> Result<(), AGIError>
where
    H: CallHandler,
{
    let mut framer = LineFramer::lf();
    let (env, leftover) = read_environment(&mut stream, &mut framer).await?;
    let url = match env.request() {
        Some(request) => match AGIUrl::parse(request) {
            Ok(url) => Some(url),
            Err(error) => {
                warn!(%error, "agi_request is not a parsable url");
                None
            }
        },
        None => None,
    };
    let (control, commands) = mpsc::unbounded_channel();
    tokio::spawn(drive_session(stream, commands, framer, leftover));
    let connection = Connection::new(env, url, control);
    match handler.start_call(&connection).await {
        Ok(()) => debug!("call handler finished"),
        Err(error) => warn!(%error, "call handler failed"),
    }
    connection.finish();
    Ok(())
}
