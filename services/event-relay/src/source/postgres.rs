//! Postgres LISTEN/NOTIFY implementation of [`NotificationSource`].

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use tracing::{debug, info};

use super::{NotificationSource, NotificationStream, SourceSignal};
use crate::error::ConnectionError;

/// Opens a dedicated (non-pooled) connection per subscription.
#[derive(Debug, Clone)]
pub struct PgNotificationSource {
    database_url: String,
}

impl PgNotificationSource {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn NotificationStream>, ConnectionError> {
        let mut listener = PgListener::connect(&self.database_url)
            .await
            .map_err(ConnectionError::source_error)?;
        listener
            .listen(channel)
            .await
            .map_err(ConnectionError::source_error)?;

        info!(channel, "Listening for notifications");

        Ok(Box::new(PgNotificationStream {
            listener,
            channel: channel.to_string(),
            reconnect_pending: false,
        }))
    }
}

/// Wrapper for a `PgListener` subscribed to one channel.
pub struct PgNotificationStream {
    listener: PgListener,
    channel: String,
    reconnect_pending: bool,
}

#[async_trait]
impl NotificationStream for PgNotificationStream {
    async fn next_signal(&mut self) -> Result<SourceSignal, ConnectionError> {
        if self.reconnect_pending {
            // Any statement on the listener reconnects it and re-issues LISTEN.
            sqlx::query("SELECT 1")
                .execute(&mut self.listener)
                .await
                .map_err(ConnectionError::source_error)?;
            self.reconnect_pending = false;
            return Ok(SourceSignal::Reconnected);
        }

        // With eager reconnect, `try_recv` yields `None` only after a dropped
        // connection has already been replaced.
        match self.listener.try_recv().await {
            Ok(Some(notification)) => {
                debug!(
                    channel = notification.channel(),
                    process_id = notification.process_id(),
                    "Received notification"
                );
                Ok(SourceSignal::Notification(notification.payload().to_string()))
            }
            Ok(None) => Ok(SourceSignal::Reconnected),
            Err(err) => {
                // Only a lost connection can have dropped notifications.
                if is_connection_loss(&err) {
                    self.reconnect_pending = true;
                }
                Err(ConnectionError::source_error(err))
            }
        }
    }

    async fn close(mut self: Box<Self>) -> Result<(), ConnectionError> {
        let result = self
            .listener
            .unlisten_all()
            .await
            .map_err(ConnectionError::source_error);
        info!(channel = %self.channel, "Stopped listening for notifications");
        // The connection closes when the listener drops here.
        result
    }
}

/// Errors after which the listener has no live connection. SQLSTATE class 08
/// is a connection exception; 57P01..57P03 are server shutdown or start-up.
fn is_connection_loss(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn test_io_errors_count_as_connection_loss() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionRefused,
        ] {
            let err = sqlx::Error::Io(io::Error::new(kind, "socket"));
            assert!(is_connection_loss(&err), "{kind:?}");
        }
        assert!(is_connection_loss(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn test_other_errors_keep_the_connection() {
        assert!(!is_connection_loss(&sqlx::Error::Protocol(
            "unexpected message".to_string()
        )));
        assert!(!is_connection_loss(&sqlx::Error::ColumnNotFound(
            "payload".to_string()
        )));
        assert!(!is_connection_loss(&sqlx::Error::RowNotFound));
    }
}
