//! Team connections.
//!
//! The [`ConnectionRegistry`] holds at most one live [`Connection`] per team. When a team
//! connects while a connection is already bound, the existing one is probed: if it answers in
//! time the newcomer is turned away, otherwise it is evicted and replaced.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::{debug, info, instrument, warn};

use crate::error::ArenaError;
use crate::protocol::ServerMessage;
use crate::transport::WRITE_TIMEOUT;

/// Identifies one binding of a connection to a team.
pub type ConnectionId = u64;

/// Outcome of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The peer answered in time.
    Healthy,
    /// No answer before the timeout.
    TimedOut,
    /// The connection is closed or broken.
    Gone,
}

/// One end of a team session, as seen by the server.
pub trait Connection: Send + Sync + Debug {
    /// Sends one message.
    fn send(&self, message: &ServerMessage) -> anyhow::Result<()>;

    /// Sends one message, giving up once `deadline` has passed.
    fn send_before(&self, message: &ServerMessage, _deadline: Instant) -> anyhow::Result<()> {
        self.send(message)
    }

    /// Sends a health probe and waits at most `timeout` for the answer.
    fn probe(&self, timeout: Duration) -> ProbeOutcome;

    /// Tells the peer why the session ends, then closes it.
    fn close(&self, reason: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct Bound {
    id: ConnectionId,
    connection: Arc<dyn Connection>,
}

/// Team identity → live connection.
#[derive(Debug)]
pub struct ConnectionRegistry {
    slots: Mutex<HashMap<String, Option<Bound>>>,
    registrations: HashMap<String, Mutex<()>>,
    probe_timeout: Duration,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Registry accepting the given teams only.
    pub fn new(teams: &[String], probe_timeout: Duration) -> ConnectionRegistry {
        ConnectionRegistry {
            slots: Mutex::new(teams.iter().map(|t| (t.clone(), None)).collect()),
            registrations: teams.iter().map(|t| (t.clone(), Mutex::new(()))).collect(),
            probe_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Option<Bound>>> {
        self.slots.lock().expect("poisoned")
    }

    /// Binds `connection` to `team`.
    ///
    /// If the team already has a connection, that connection is probed first; it is evicted if
    /// it does not answer in time, otherwise `connection` is closed with an "already connected"
    /// reason. Attempts for the same team are handled one at a time.
    ///
    /// # Errors
    /// [`ArenaError::UnknownTeam`] or [`ArenaError::AlreadyConnected`]; in both cases
    /// `connection` has been closed and the registry is unchanged.
    #[instrument(skip(self, connection))]
    pub fn register(
        &self,
        team: &str,
        connection: Arc<dyn Connection>,
    ) -> Result<ConnectionId, ArenaError> {
        let Some(registration) = self.registrations.get(team) else {
            let err = ArenaError::UnknownTeam(team.to_string());
            warn!("{err}");
            let _ = connection.close(&err.to_string());
            return Err(err);
        };
        let _registration = registration.lock().expect("poisoned");

        let existing = self.slots().get(team).cloned().flatten();
        if let Some(existing) = existing {
            match existing.connection.probe(self.probe_timeout) {
                ProbeOutcome::Healthy => {
                    let err = ArenaError::AlreadyConnected(team.to_string());
                    info!("{err}");
                    let _ = connection.close(&err.to_string());
                    return Err(err);
                }
                outcome => {
                    info!(?outcome, id = existing.id, "evicting stale connection");
                    if let Err(e) = existing.connection.close("replaced by a new connection") {
                        debug!("closing stale connection failed: {e}");
                    }
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots()
            .insert(team.to_string(), Some(Bound { id, connection }));
        info!(id, "team connected");
        Ok(id)
    }

    /// Clears the slot of `team` and closes its connection. Does nothing if the slot is empty
    /// or the team unknown.
    pub fn unregister(&self, team: &str) {
        let removed = self.slots().get_mut(team).and_then(Option::take);
        if let Some(bound) = removed {
            let _ = bound.connection.close("Disconnected");
            info!(team, id = bound.id, "team disconnected");
        }
    }

    /// Clears the slot of `team` only if it still holds the binding `id`.
    ///
    /// A session tearing down after being evicted must not unbind its successor.
    pub fn release(&self, team: &str, id: ConnectionId) -> bool {
        let removed = {
            let mut slots = self.slots();
            match slots.get_mut(team) {
                Some(slot) if slot.as_ref().is_some_and(|b| b.id == id) => slot.take(),
                _ => None,
            }
        };
        match removed {
            Some(bound) => {
                let _ = bound.connection.close("Disconnected");
                info!(team, id, "team disconnected");
                true
            }
            None => false,
        }
    }

    /// Connection bound to `team`, if any.
    pub fn connection(&self, team: &str) -> Option<Arc<dyn Connection>> {
        self.slots()
            .get(team)
            .and_then(|slot| slot.as_ref().map(|b| b.connection.clone()))
    }

    /// Binding id of `team`'s connection, if any.
    pub fn connection_id(&self, team: &str) -> Option<ConnectionId> {
        self.slots()
            .get(team)
            .and_then(|slot| slot.as_ref().map(|b| b.id))
    }

    /// Teams with a live connection, sorted by name.
    pub fn connected_teams(&self) -> Vec<String> {
        let mut teams = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.is_some())
            .map(|(team, _)| team.clone())
            .collect::<Vec<_>>();
        teams.sort();
        teams
    }

    /// Sends `message` to `team`.
    pub fn send_to(&self, team: &str, message: &ServerMessage) -> anyhow::Result<()> {
        let connection = self
            .connection(team)
            .ok_or_else(|| anyhow!("team {team} is not connected"))?;
        connection.send(message)
    }

    /// Sends each message to its team, all at once. Teams without a connection are skipped.
    ///
    /// Returns by `deadline` with one outcome per message handed to a connection; a send still
    /// running then is reported as failed. A failure never prevents delivery to the other
    /// teams.
    pub fn deliver(
        &self,
        messages: Vec<(String, ServerMessage)>,
        deadline: Instant,
    ) -> Vec<(String, anyhow::Result<()>)> {
        let (tx, rx) = mpsc::channel();
        let mut pending = Vec::with_capacity(messages.len());
        for (team, message) in messages {
            let Some(connection) = self.connection(&team) else {
                continue;
            };
            pending.push(team.clone());
            let tx = tx.clone();
            thread::spawn(move || {
                let outcome = connection.send_before(&message, deadline);
                let _ = tx.send((team, outcome));
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(pending.len());
        while outcomes.len() < pending.len() {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => break,
            }
        }
        outcomes.extend(rx.try_iter());
        for team in pending {
            if !outcomes.iter().any(|(t, _)| *t == team) {
                let err = anyhow!("send to {team} did not complete in time");
                outcomes.push((team, Err(err)));
            }
        }
        outcomes
    }

    /// Sends `message` to every connected team. See [`deliver`](Self::deliver).
    pub fn broadcast(&self, message: &ServerMessage) -> Vec<(String, anyhow::Result<()>)> {
        let messages = self
            .connected_teams()
            .into_iter()
            .map(|team| (team, message.clone()))
            .collect();
        self.deliver(messages, Instant::now() + WRITE_TIMEOUT)
    }
}
