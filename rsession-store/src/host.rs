//! Request lifecycle glue.
//!
//! A [`SessionHost`] opens one [`RequestSession`] per request and closes it
//! when the request ends. Closing harvests the record and waits, up to the
//! configured bound, for every write issued on its behalf. Optional
//! [`SessionEvents`] observe sessions starting and ending.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rsession_core::{SessionConfig, SessionResult};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{ConnectionManager, StoreConnector};
use crate::coordinator::TeardownReport;
use crate::record::SessionRecord;

/// Session lifecycle callbacks.
#[async_trait]
pub trait SessionEvents: Send + Sync {
    /// Called once a freshly minted session is open, before the request
    /// sees it. An error fails [`SessionHost::begin_request`].
    async fn session_started(&self, _session: &RequestSession) -> SessionResult<()> {
        Ok(())
    }

    /// Called for an abandoned session after its fields were cleared and
    /// before its removal is issued.
    async fn session_ended(&self, _record: &SessionRecord) {}
}

/// Entry point for request handling.
pub struct SessionHost {
    connections: ConnectionManager,
    events: Option<Arc<dyn SessionEvents>>,
}

impl SessionHost {
    /// Validates `config` and prepares a lazily connected store client.
    pub fn new(config: SessionConfig, connector: Arc<dyn StoreConnector>) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self {
            connections: ConnectionManager::new(config, connector),
            events: None,
        })
    }

    /// Install lifecycle callbacks.
    pub fn with_events(mut self, events: Arc<dyn SessionEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        self.connections.config()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Open the session for a request.
    ///
    /// An incoming session id is reused; without one (or with an empty one)
    /// a fresh id is minted, the session is marked new, and
    /// [`SessionEvents::session_started`] runs.
    pub async fn begin_request(&self, session_id: Option<&str>) -> SessionResult<RequestSession> {
        let (session_id, is_new) = match session_id.filter(|id| !id.is_empty()) {
            Some(id) => (id.to_string(), false),
            None => (Uuid::new_v4().to_string(), true),
        };
        let store = self.connections.store().await?;
        let record = SessionRecord::new(session_id, store, self.config().session_timeout);
        debug!(session_key = %record.record_key(), is_new, "session opened");
        let session = RequestSession {
            record,
            is_new,
            abandoned: false,
            write_wait: self.config().write_wait,
            events: self.events.clone(),
        };
        if is_new {
            if let Some(events) = &self.events {
                events.session_started(&session).await?;
            }
        }
        Ok(session)
    }
}

impl fmt::Debug for SessionHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHost")
            .field("connections", &self.connections)
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// The session bound to one in-flight request.
pub struct RequestSession {
    record: SessionRecord,
    is_new: bool,
    abandoned: bool,
    write_wait: Duration,
    events: Option<Arc<dyn SessionEvents>>,
}

impl RequestSession {
    pub fn id(&self) -> &str {
        self.record.session_id()
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Whether the id was minted for this request.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Discard the session when the request ends.
    pub fn abandon(&mut self) {
        self.abandoned = true;
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Release the session: persist what is owed and wait for the store.
    ///
    /// An abandoned session is cleared and reported through
    /// [`SessionEvents::session_ended`] first.
    pub async fn end_request(self) -> TeardownReport {
        if self.abandoned {
            self.record.clear().await;
            if let Some(events) = &self.events {
                events.session_ended(&self.record).await;
            }
        }
        let report = self.record.finish(self.write_wait).await;
        if !report.all_completed() {
            warn!(
                session_key = %self.record.record_key(),
                failed = report.failed.len(),
                outstanding = report.outstanding,
                "session teardown incomplete"
            );
        }
        report
    }
}

impl fmt::Debug for RequestSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSession")
            .field("record", &self.record)
            .field("is_new", &self.is_new)
            .field("abandoned", &self.abandoned)
            .finish_non_exhaustive()
    }
}
