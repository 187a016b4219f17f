pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod mailer;

mod conversations;
mod messaging;
mod notifications;

use std::sync::Arc;

use courier_db::Database;

pub use config::CourierConfig;
pub use conversations::PairOptions;
pub use directory::{Directory, HttpDirectory, StaticDirectory};
pub use dispatcher::Dispatcher;
pub use error::{ChatError, ChatResult};
pub use identity::TokenVerifier;
pub use mailer::{EmailRequest, LogMailer, Mailer, WebhookMailer};
pub use messaging::OutgoingMessage;
pub use notifications::NotificationRequest;

/// Largest page any listing returns.
pub const MAX_PAGE_SIZE: u32 = 100;

/// The live conversation and notification service.
///
/// Cheap to clone; every connection task and HTTP handler holds one.
#[derive(Clone)]
pub struct Courier {
    inner: Arc<CourierInner>,
}

struct CourierInner {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    mailer: Arc<dyn Mailer>,
    directory: Arc<dyn Directory>,
    config: CourierConfig,
}

impl Courier {
    pub fn new(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        mailer: Arc<dyn Mailer>,
        directory: Arc<dyn Directory>,
        config: CourierConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CourierInner {
                db,
                dispatcher,
                mailer,
                directory,
                config,
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn config(&self) -> &CourierConfig {
        &self.inner.config
    }

    /// Run a store call on the blocking pool so it never stalls a connection task.
    async fn blocking<F, T>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
    }
}

/// Clamp a client-supplied page size.
pub(crate) fn page_limit(limit: Option<u32>, default: u32) -> u32 {
    limit.unwrap_or(default).clamp(1, MAX_PAGE_SIZE)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Records every email instead of sending it. Fails on demand.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<EmailRequest>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: &EmailRequest) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("mail service down");
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    pub fn courier(mailer: Arc<RecordingMailer>, directory: StaticDirectory) -> Courier {
        Courier::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Dispatcher::new(),
            mailer,
            Arc::new(directory),
            CourierConfig::default(),
        )
    }
}
