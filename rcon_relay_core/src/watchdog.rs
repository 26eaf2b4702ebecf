use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    rcon::{PoolError, RconService},
    store::{ServerStore, StoreError},
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("Couldn't list servers: {0}")]
    Store(#[from] StoreError),
}

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Servers storage says should be connected.
    pub authoritative: usize,
    /// Servers whose game has RCON turned off.
    pub skipped: usize,
    pub attempted: usize,
    pub created: usize,
    pub unreachable: usize,
    pub failed: usize,
}

/// Keeps one protocol client alive for every server that should have one.
///
/// There is no back-off: a server that couldn't be reached is simply tried
/// again on the next wake. Removing clients for deleted servers is up to
/// whoever deletes them.
pub struct Watchdog<S: ?Sized> {
    store: Arc<S>,
    pool: RconService,
    interval: Duration,
}

impl<S> Watchdog<S>
where
    S: ServerStore + ?Sized + 'static,
{
    #[must_use]
    pub const fn new(store: Arc<S>, pool: RconService, interval: Duration) -> Self {
        Self {
            store,
            pool,
            interval,
        }
    }

    /// Starts the watchdog loop. The first pass runs immediately.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::task::spawn(self.run())
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!("Watchdog started, checking connections every {:?}", self.interval);
        loop {
            interval.tick().await;
            match self.run_cycle().await {
                Ok(report) if report.attempted > 0 => tracing::debug!(
                    "Watchdog: {} of {} attempted connections succeeded ({} unreachable, {} failed)",
                    report.created,
                    report.attempted,
                    report.unreachable,
                    report.failed
                ),
                Ok(_) => {}
                Err(e) => tracing::error!("Watchdog cycle failed, retrying next interval: {e}"),
            }
        }
    }

    /// One reconciliation pass: connect every authoritative server that
    /// doesn't have a client yet. Never removes clients.
    ///
    /// # Errors
    /// If the authoritative server list couldn't be fetched
    pub async fn run_cycle(&self) -> Result<CycleReport, WatchdogError> {
        let servers = self.store.servers_requiring_connection().await?;
        let connected = self.pool.get_clients();
        let profiles = self.pool.profiles();

        let mut report = CycleReport {
            authoritative: servers.len(),
            ..CycleReport::default()
        };

        let missing: Vec<_> = servers
            .into_iter()
            .filter(|s| !connected.contains_key(&s.id))
            .filter(|s| match profiles.get(&s.game) {
                Some(profile) if !profile.rcon_enabled => {
                    tracing::trace!("Skipping server {}, RCON is disabled for {}", s.id, s.game);
                    report.skipped += 1;
                    false
                }
                _ => true,
            })
            .collect();
        report.attempted = missing.len();

        let pool = &self.pool;
        let attempts = missing.into_iter().map(|server| async move {
            let id = server.id;
            (id, pool.create_client(server).await)
        });

        for (id, result) in join_all(attempts).await {
            match result {
                Ok(_) => report.created += 1,
                Err(e) if e.is_unreachable() => {
                    report.unreachable += 1;
                    tracing::debug!("Server {id} is unreachable: {e}");
                }
                Err(PoolError::AlreadyConnected(_) | PoolError::Removed(_)) => {
                    tracing::debug!("Server {id} changed while connecting, leaving it for now.");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("Failed to connect to server {id}: {e}");
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        rcon::tests::{test_profiles, test_timeouts, unreachable_descriptor, FakeConsole},
        store::{ServerDescriptor, ServerId, StaticServerStore},
    };

    fn pool() -> RconService {
        RconService::new(test_profiles(), test_timeouts())
    }

    #[tokio::test]
    async fn cycle_connects_only_missing_servers() {
        let pool = pool();
        let s1 = FakeConsole::start().await;
        let s2 = FakeConsole::start().await;

        let existing = pool.create_client(s1.descriptor(1)).await.unwrap();
        let store = Arc::new(StaticServerStore::new(vec![
            s1.descriptor(1),
            s2.descriptor(2),
            unreachable_descriptor(3).await,
        ]));
        let watchdog = Watchdog::new(store.clone(), pool.clone(), DEFAULT_INTERVAL);

        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                authoritative: 3,
                skipped: 0,
                attempted: 2,
                created: 1,
                unreachable: 1,
                failed: 0,
            }
        );

        let clients = pool.get_clients();
        assert_eq!(clients.len(), 2);
        assert!(!clients.contains_key(&ServerId(3)));
        // S1's original connection was left alone.
        assert_eq!(
            clients[&ServerId(1)].connection_id(),
            existing.connection_id()
        );

        // Only the unreachable server is retried.
        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.unreachable, 1);
    }

    #[tokio::test]
    async fn cycle_never_deletes() {
        let pool = pool();
        let s1 = FakeConsole::start().await;
        pool.create_client(s1.descriptor(1)).await.unwrap();

        let store = Arc::new(StaticServerStore::new(Vec::new()));
        let watchdog = Watchdog::new(store, pool.clone(), DEFAULT_INTERVAL);

        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(pool.get_clients().len(), 1);
    }

    #[tokio::test]
    async fn disabled_and_misconfigured_servers() {
        let pool = pool();
        let mut disabled = unreachable_descriptor(1).await;
        disabled.game = "offline".into();
        let mut unknown = unreachable_descriptor(2).await;
        unknown.game = "quake".into();

        let store = Arc::new(StaticServerStore::new(vec![disabled, unknown]));
        let report = Watchdog::new(store, pool, DEFAULT_INTERVAL)
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);
    }

    /// Fails the first few listings, then behaves.
    struct FlakyStore {
        failures_left: AtomicUsize,
        servers: StaticServerStore,
    }

    impl ServerStore for FlakyStore {
        fn servers_requiring_connection(
            &self,
        ) -> BoxFuture<'_, Result<Vec<ServerDescriptor>, StoreError>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Box::pin(async { Err(StoreError::Unavailable("database is down".into())) });
            }
            self.servers.servers_requiring_connection()
        }

        fn server_by_id(&self, id: ServerId) -> BoxFuture<'_, Result<ServerDescriptor, StoreError>> {
            self.servers.server_by_id(id)
        }
    }

    #[tokio::test]
    async fn loop_survives_store_errors() {
        let pool = pool();
        let console = FakeConsole::start().await;
        let store = Arc::new(FlakyStore {
            failures_left: AtomicUsize::new(2),
            servers: StaticServerStore::new(vec![console.descriptor(5)]),
        });

        let watchdog = Watchdog::new(store.clone(), pool.clone(), Duration::from_millis(20));
        assert!(watchdog.run_cycle().await.is_err());

        let task = watchdog.spawn();
        for _ in 0..100 {
            if pool.get_client(ServerId(5)).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(pool.get_client(ServerId(5)).is_some());
        assert_eq!(store.failures_left.load(Ordering::SeqCst), 0);
        task.abort();
    }
}
