use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::config::{AppConfig, NoteOptions, SyncOptions};
use crate::remote::DocumentStore;
use crate::session::{CredentialProvider, SessionState, UserId};
use crate::storage::{self, LocalStore};
use crate::sync::{RemoteOp, SyncEvent, SyncStatus, WriteQueue};

pub mod confirm;
pub mod state;

pub use confirm::{AlwaysConfirm, Confirm, NeverConfirm, StdinConfirm};
pub use state::{derive_title, IdGenerator, Note, NoteCollection, NoteId};

const DELETE_PROMPT: &str = "Are you sure you want to delete this note?";

/// Shared view of whether the initial remote fetch is running.
#[derive(Debug, Clone, Default)]
pub struct LoadingFlag(Arc<AtomicBool>);

impl LoadingFlag {
    pub fn is_loading(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn raise(&self) -> LoadingGuard<'_> {
        self.0.store(true, Ordering::SeqCst);
        LoadingGuard(self)
    }
}

struct LoadingGuard<'a>(&'a LoadingFlag);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.store(false, Ordering::SeqCst);
    }
}

pub struct Collaborators {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn DocumentStore>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub confirm: Box<dyn Confirm>,
}

/// Owns the note collection and decides which store mirrors it.
pub struct NoteController {
    options: NoteOptions,
    sync_options: SyncOptions,
    notes: NoteCollection,
    ids: IdGenerator,
    session: SessionState,
    loading: LoadingFlag,
    last_error: Option<String>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn DocumentStore>,
    credentials: Arc<dyn CredentialProvider>,
    confirm: Box<dyn Confirm>,
    queue: WriteQueue,
    session_updates: Receiver<SessionState>,
}

impl NoteController {
    pub fn new(config: &AppConfig, deps: Collaborators) -> Result<Self> {
        let queue = WriteQueue::spawn(Arc::clone(&deps.remote), &config.sync)
            .context("starting remote write queue")?;
        let session_updates = deps.credentials.subscribe();
        Ok(Self {
            options: config.notes.clone(),
            sync_options: config.sync.clone(),
            notes: NoteCollection::default(),
            ids: IdGenerator::default(),
            session: SessionState::Resolving,
            loading: LoadingFlag::default(),
            last_error: None,
            local: deps.local,
            remote: deps.remote,
            credentials: deps.credentials,
            confirm: deps.confirm,
            queue,
            session_updates,
        })
    }

    pub fn notes(&self) -> &NoteCollection {
        &self.notes
    }

    pub fn active_id(&self) -> Option<NoteId> {
        self.notes.active_id()
    }

    pub fn active_note(&self) -> Option<&Note> {
        self.notes.active()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_loading()
    }

    pub fn loading_flag(&self) -> LoadingFlag {
        self.loading.clone()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.queue.status()
    }

    /// Subscribes to write-queue outcomes from this point on.
    pub fn sync_events(&self) -> Receiver<SyncEvent> {
        self.queue.events()
    }

    pub fn set_confirm(&mut self, confirm: Box<dyn Confirm>) {
        self.confirm = confirm;
    }

    pub fn add_note(&mut self) -> NoteId {
        let notes = &self.notes;
        let id = self.ids.next_id(|id| notes.contains(id));
        let note = Note::blank(id, &self.options);
        self.notes.push(note.clone());
        tracing::debug!(note_id = id, "added note");
        if let Some(user) = self.session.user().cloned() {
            self.queue.submit(user, RemoteOp::Put(note));
        }
        self.mirror(true);
        id
    }

    pub fn select_note(&mut self, id: NoteId) -> bool {
        if !self.notes.select(id) {
            tracing::debug!(note_id = id, "ignoring selection of unknown note");
            return false;
        }
        self.mirror(false);
        true
    }

    /// Deletes `id` once the confirmation gate agrees. Unknown ids return
    /// without prompting.
    pub fn delete_note(&mut self, id: NoteId) -> bool {
        if !self.notes.contains(id) {
            tracing::debug!(note_id = id, "ignoring delete of unknown note");
            return false;
        }
        if !self.confirm.confirm(DELETE_PROMPT) {
            tracing::debug!(note_id = id, "delete declined");
            return false;
        }
        self.notes.remove(id);
        tracing::debug!(note_id = id, active = ?self.notes.active_id(), "deleted note");
        if let Some(user) = self.session.user().cloned() {
            self.queue.submit(user, RemoteOp::Remove(id));
        }
        self.mirror(true);
        true
    }

    pub fn delete_active_note(&mut self) -> bool {
        match self.notes.active_id() {
            Some(id) => self.delete_note(id),
            None => false,
        }
    }

    /// Replaces the stored note with the same id, keeping its position.
    pub fn update_note(&mut self, note: Note) -> bool {
        if !self.notes.replace(note.clone()) {
            tracing::debug!(note_id = note.id, "ignoring update of unknown note");
            return false;
        }
        if let Some(user) = self.session.user().cloned() {
            self.queue.submit(user, RemoteOp::Patch(note));
        }
        self.mirror(true);
        true
    }

    /// Edit entry point: stores `content` and re-derives the title from it.
    pub fn update_content(&mut self, id: NoteId, content: impl Into<String>) -> bool {
        let Some(current) = self.notes.get(id) else {
            return false;
        };
        let updated = current.with_content(content, &self.options);
        self.update_note(updated)
    }

    /// Appends the current local time as a new line of the active note.
    pub fn insert_timestamp(&mut self) -> bool {
        let Some(active) = self.notes.active() else {
            return false;
        };
        let id = active.id;
        let stamp = current_timestamp();
        let content = if active.content.is_empty() {
            stamp
        } else {
            format!("{}\n{stamp}", active.content)
        };
        self.update_content(id, content)
    }

    /// Moves the note at `from` to `to`. Order only lives locally.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        if !self.notes.move_index(from, to) {
            tracing::debug!(from, to, len = self.notes.len(), "ignoring out-of-range reorder");
            return false;
        }
        self.mirror(false);
        true
    }

    /// Applies every session update the provider has published so far.
    pub fn pump_session(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(state) = self.session_updates.try_recv() {
            self.on_session_change(state);
            applied += 1;
        }
        applied
    }

    /// Blocks until the session leaves `Resolving`.
    pub fn await_session(&mut self, timeout: Duration) -> Result<&SessionState> {
        let deadline = Instant::now() + timeout;
        self.pump_session();
        while self.session.is_resolving() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.session_updates.recv_timeout(remaining) {
                Ok(state) => self.on_session_change(state),
                Err(RecvTimeoutError::Timeout) => {
                    bail!("session did not resolve within {timeout:?}")
                }
                Err(RecvTimeoutError::Disconnected) => {
                    bail!("credential provider closed its session stream")
                }
            }
        }
        Ok(&self.session)
    }

    pub fn on_session_change(&mut self, next: SessionState) {
        if next == self.session {
            return;
        }
        let previous = std::mem::replace(&mut self.session, next.clone());
        let epoch = self.queue.advance_epoch();
        tracing::info!(?previous, session = ?next, epoch, "session changed");
        self.last_error = None;
        match next {
            SessionState::Resolving => {}
            SessionState::Authenticated(user) => self.reload_remote(&user),
            SessionState::Unauthenticated => self.reload_local(),
        }
    }

    /// Signs in and copies any locally saved notes into the new user's
    /// remote collection, overwriting documents with the same ids. The
    /// reload itself happens when the session update arrives.
    pub fn login(&mut self) -> Result<UserId> {
        let user = self.credentials.sign_in().context("signing in")?;
        match storage::load_saved_notes(self.local.as_ref()) {
            Ok(Some(notes)) if !notes.is_empty() => {
                self.remote
                    .put_all(&user, &notes)
                    .with_context(|| format!("copying local notes to {user}"))?;
                tracing::info!(user = %user, count = notes.len(), "copied local notes to remote");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(?err, "local notes unreadable, skipping copy to remote");
            }
        }
        Ok(user)
    }

    /// Lets queued writes for the signed-in user land, then signs out. Writes
    /// still pending after the flush timeout are discarded by the queue and
    /// show up in `sync_status`.
    pub fn logout(&mut self) -> Result<()> {
        if !self.flush_remote() {
            tracing::warn!("signing out with remote writes still pending");
        }
        self.credentials.sign_out().context("signing out")
    }

    /// Waits for queued remote writes, bounded by the configured timeout.
    pub fn flush_remote(&self) -> bool {
        self.flush_remote_within(self.sync_options.flush_timeout())
    }

    pub fn flush_remote_within(&self, timeout: Duration) -> bool {
        let drained = self.queue.wait_idle(timeout);
        if !drained {
            tracing::warn!(pending = self.queue.pending(), "remote writes still pending");
        }
        drained
    }

    fn reload_remote(&mut self, user: &UserId) {
        let fetched = {
            let _loading = self.loading.raise();
            self.remote.list_notes(user)
        };
        match fetched {
            Ok(notes) if notes.is_empty() => {
                tracing::info!(user = %user, "no remote notes, starting a fresh one");
                self.notes = NoteCollection::default();
                self.add_note();
            }
            Ok(notes) => {
                let first = notes.first().map(|note| note.id);
                self.replace_collection(NoteCollection::from_parts(notes, first));
                tracing::info!(user = %user, count = self.notes.len(), "loaded remote notes");
            }
            Err(err) => {
                tracing::warn!(user = %user, ?err, "loading remote notes failed");
                self.last_error = Some(format!("loading notes for {user}: {err}"));
                self.notes = NoteCollection::default();
            }
        }
    }

    fn reload_local(&mut self) {
        match storage::load_notes(self.local.as_ref()) {
            Ok(Some(saved)) if !saved.is_empty() => {
                self.replace_collection(saved);
                tracing::info!(count = self.notes.len(), "loaded local notes");
            }
            Ok(_) => {
                tracing::info!("no saved notes, starting a fresh one");
                self.notes = NoteCollection::default();
                self.add_note();
            }
            Err(err) => {
                tracing::warn!(?err, "saved notes unreadable, starting a fresh one");
                self.last_error = Some(format!("reading saved notes: {err}"));
                self.notes = NoteCollection::default();
                self.add_note();
            }
        }
    }

    fn replace_collection(&mut self, notes: NoteCollection) {
        for note in notes.iter() {
            self.ids.observe(note.id);
        }
        self.notes = notes;
    }

    /// Writes the whole collection to whichever store the session selects.
    /// `notes_changed` is false for selection and order changes, which never
    /// reach the remote store.
    fn mirror(&mut self, notes_changed: bool) {
        match &self.session {
            SessionState::Authenticated(user) => {
                if notes_changed && !self.notes.is_empty() {
                    self.queue
                        .submit(user.clone(), RemoteOp::PutAll(self.notes.to_vec()));
                }
            }
            SessionState::Unauthenticated => {
                if let Err(err) = storage::save_notes(self.local.as_ref(), &self.notes) {
                    tracing::warn!(?err, "saving notes locally failed");
                    self.last_error = Some(format!("saving notes: {err}"));
                }
            }
            SessionState::Resolving => {}
        }
    }
}

fn current_timestamp() -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&format)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryDocumentStore;
    use crate::session::StaticCredentialProvider;
    use crate::storage::{MemoryLocalStore, ACTIVE_NOTE_KEY, NOTES_KEY};
    use std::cell::Cell;
    use std::rc::Rc;

    struct Harness {
        controller: NoteController,
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryDocumentStore>,
        credentials: Arc<StaticCredentialProvider>,
    }

    fn harness() -> anyhow::Result<Harness> {
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryDocumentStore::new());
        let credentials = Arc::new(StaticCredentialProvider::resolving());
        let mut config = AppConfig::default();
        config.sync.initial_backoff_ms = 1;
        config.sync.max_backoff_ms = 2;
        let controller = NoteController::new(
            &config,
            Collaborators {
                local: local.clone(),
                remote: remote.clone(),
                credentials: credentials.clone(),
                confirm: Box::new(AlwaysConfirm),
            },
        )?;
        Ok(Harness {
            controller,
            local,
            remote,
            credentials,
        })
    }

    fn signed_out() -> anyhow::Result<Harness> {
        let mut h = harness()?;
        h.controller.on_session_change(SessionState::Unauthenticated);
        Ok(h)
    }

    /// Leaves notes `[A, B, C]` with ids in that order and `C` active.
    fn three_notes(h: &mut Harness) -> [NoteId; 3] {
        let a = h.controller.active_id().expect("seeded note");
        let b = h.controller.add_note();
        let c = h.controller.add_note();
        [a, b, c]
    }

    struct CountingConfirm {
        answer: bool,
        asked: Rc<Cell<u32>>,
    }

    impl Confirm for CountingConfirm {
        fn confirm(&self, _message: &str) -> bool {
            self.asked.set(self.asked.get() + 1);
            self.answer
        }
    }

    #[test]
    fn unauthenticated_start_seeds_one_note_and_persists_it() -> anyhow::Result<()> {
        let h = signed_out()?;
        let notes = h.controller.notes();
        assert_eq!(notes.len(), 1);
        let seeded = h.controller.active_note().expect("active note");
        assert_eq!(seeded.title, "Untitled Note");
        assert_eq!(seeded.content, "");
        assert!(h.local.raw(NOTES_KEY).is_some());
        assert_eq!(
            h.local.raw(ACTIVE_NOTE_KEY),
            Some(seeded.id.to_string())
        );
        Ok(())
    }

    #[test]
    fn added_ids_are_pairwise_distinct() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        for _ in 0..200 {
            h.controller.add_note();
        }
        let mut ids = h.controller.notes().ids();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
        Ok(())
    }

    #[test]
    fn adding_after_a_maximal_saved_id_does_not_overflow() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.local.set(
            NOTES_KEY,
            &format!(r#"[{{"id":{},"title":"edge","content":"edge"}}]"#, NoteId::MAX),
        )?;
        h.controller.on_session_change(SessionState::Unauthenticated);
        assert_eq!(h.controller.notes().ids(), vec![NoteId::MAX]);

        let first = h.controller.add_note();
        let second = h.controller.add_note();
        let mut ids = h.controller.notes().ids();
        assert_eq!(ids.len(), 3);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(h.controller.active_id(), Some(second));
        assert_ne!(first, NoteId::MAX);
        Ok(())
    }

    #[test]
    fn delete_active_middle_selects_successor() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        let [a, b, c] = three_notes(&mut h);
        assert!(h.controller.select_note(b));
        assert!(h.controller.delete_note(b));
        assert_eq!(h.controller.active_id(), Some(c));
        assert_eq!(h.controller.notes().ids(), vec![a, c]);
        Ok(())
    }

    #[test]
    fn delete_active_last_selects_new_last() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        let [_, b, c] = three_notes(&mut h);
        assert!(h.controller.delete_note(c));
        assert_eq!(h.controller.active_id(), Some(b));
        Ok(())
    }

    #[test]
    fn deleting_sole_note_leaves_no_selection() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        assert!(h.controller.delete_active_note());
        assert!(h.controller.notes().is_empty());
        assert_eq!(h.controller.active_id(), None);
        assert_eq!(h.local.raw(ACTIVE_NOTE_KEY).as_deref(), Some("null"));
        Ok(())
    }

    #[test]
    fn declined_delete_changes_nothing() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        let [_, b, _] = three_notes(&mut h);
        let asked = Rc::new(Cell::new(0));
        h.controller.set_confirm(Box::new(CountingConfirm {
            answer: false,
            asked: asked.clone(),
        }));
        let before = h.controller.notes().clone();

        assert!(!h.controller.delete_note(b));
        assert_eq!(asked.get(), 1);
        assert_eq!(h.controller.notes(), &before);
        Ok(())
    }

    #[test]
    fn unknown_ids_are_silent_no_ops() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        three_notes(&mut h);
        let asked = Rc::new(Cell::new(0));
        h.controller.set_confirm(Box::new(CountingConfirm {
            answer: true,
            asked: asked.clone(),
        }));
        let before = h.controller.notes().clone();

        assert!(!h.controller.select_note(-1));
        assert!(!h.controller.delete_note(-1));
        assert!(!h.controller.update_content(-1, "ghost"));
        assert_eq!(asked.get(), 0);
        assert_eq!(h.controller.notes(), &before);
        Ok(())
    }

    #[test]
    fn update_content_rederives_title_in_place() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        let [a, b, c] = three_notes(&mut h);
        assert!(h.controller.update_content(b, "hello\nworld"));

        let notes = h.controller.notes();
        assert_eq!(notes.ids(), vec![a, b, c]);
        let edited = notes.get(b).expect("edited note");
        assert_eq!(edited.title, "hello");
        assert_eq!(edited.content, "hello\nworld");

        h.controller.update_content(b, "");
        assert_eq!(h.controller.notes().get(b).map(|n| n.title.as_str()), Some("Untitled Note"));
        Ok(())
    }

    #[test]
    fn insert_timestamp_appends_line_to_active_note() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        let id = h.controller.active_id().expect("active");
        assert!(h.controller.insert_timestamp());
        let stamped = h.controller.active_note().expect("active").content.clone();
        assert_eq!(stamped.len(), "2024-01-01 00:00:00".len());
        assert_eq!(h.controller.active_note().map(|n| n.title.clone()), Some(stamped.clone()));

        h.controller.update_content(id, "meeting");
        assert!(h.controller.insert_timestamp());
        let content = &h.controller.active_note().expect("active").content;
        assert!(content.starts_with("meeting\n"));
        assert_eq!(h.controller.active_note().map(|n| n.title.as_str()), Some("meeting"));
        Ok(())
    }

    #[test]
    fn reorder_is_local_only() -> anyhow::Result<()> {
        let mut h = harness()?;
        let user = UserId::new("ada");
        h.controller.on_session_change(SessionState::Authenticated(user.clone()));
        let [a, b, c] = three_notes(&mut h);
        assert!(h.controller.flush_remote_within(Duration::from_secs(5)));
        let writes = h.remote.write_count();

        assert!(h.controller.reorder(2, 0));
        assert_eq!(h.controller.notes().ids(), vec![c, a, b]);
        assert!(h.controller.reorder(1, 1));
        assert_eq!(h.controller.notes().ids(), vec![c, a, b]);
        assert!(!h.controller.reorder(0, 9));

        assert!(h.controller.flush_remote_within(Duration::from_secs(5)));
        assert_eq!(h.remote.write_count(), writes);
        Ok(())
    }

    #[test]
    fn local_round_trip_survives_restart() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        let [_, b, _] = three_notes(&mut h);
        h.controller.update_content(b, "keep me");
        h.controller.select_note(b);
        h.controller.reorder(0, 2);
        let expected = h.controller.notes().clone();

        let credentials = Arc::new(StaticCredentialProvider::new(SessionState::Unauthenticated));
        let mut restarted = NoteController::new(
            &AppConfig::default(),
            Collaborators {
                local: h.local.clone(),
                remote: h.remote.clone(),
                credentials,
                confirm: Box::new(AlwaysConfirm),
            },
        )?;
        restarted.pump_session();
        assert_eq!(restarted.notes(), &expected);
        assert_eq!(restarted.active_id(), Some(b));
        Ok(())
    }

    #[test]
    fn malformed_local_state_seeds_fresh_note() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.local.set(NOTES_KEY, "[{broken")?;
        h.controller.on_session_change(SessionState::Unauthenticated);

        assert_eq!(h.controller.notes().len(), 1);
        assert!(h.controller.last_error().is_some());
        assert!(storage::load_notes(&*h.local)?.is_some());
        Ok(())
    }

    #[test]
    fn authenticated_start_loads_remote_notes_under_loading_flag() -> anyhow::Result<()> {
        let mut h = harness()?;
        let user = UserId::new("ada");
        let n1 = Note {
            id: 100,
            title: "first".into(),
            content: "first".into(),
        };
        let n2 = Note {
            id: 200,
            title: "second".into(),
            content: "second".into(),
        };
        h.remote.seed(&user, [n1.clone(), n2.clone()]);

        let flag = h.controller.loading_flag();
        let seen = Arc::new(AtomicBool::new(false));
        let seen_in_hook = Arc::clone(&seen);
        h.remote
            .set_list_hook(move || seen_in_hook.store(flag.is_loading(), Ordering::SeqCst));
        assert!(!h.controller.is_loading());

        h.credentials.resolve(SessionState::Authenticated(user.clone()));
        h.controller.pump_session();

        assert!(seen.load(Ordering::SeqCst), "loading flag raised during fetch");
        assert!(!h.controller.is_loading());
        assert_eq!(h.controller.notes().to_vec(), vec![n1.clone(), n2]);
        assert_eq!(h.controller.active_id(), Some(n1.id));
        Ok(())
    }

    #[test]
    fn authenticated_start_with_empty_remote_seeds_and_uploads() -> anyhow::Result<()> {
        let mut h = harness()?;
        let user = UserId::new("ada");
        h.controller.on_session_change(SessionState::Authenticated(user.clone()));

        assert_eq!(h.controller.notes().len(), 1);
        assert!(h.controller.flush_remote_within(Duration::from_secs(5)));
        assert_eq!(h.remote.snapshot(&user), h.controller.notes().to_vec());
        assert!(h.local.raw(NOTES_KEY).is_none());
        Ok(())
    }

    #[test]
    fn authenticated_edits_are_mirrored_remotely() -> anyhow::Result<()> {
        let mut h = harness()?;
        let user = UserId::new("ada");
        h.controller.on_session_change(SessionState::Authenticated(user.clone()));
        let [a, b, _] = three_notes(&mut h);
        h.controller.update_content(a, "alpha");
        h.controller.delete_note(b);
        assert!(h.controller.flush_remote_within(Duration::from_secs(5)));

        assert_eq!(h.remote.snapshot(&user), h.controller.notes().to_vec());
        assert!(h.local.raw(NOTES_KEY).is_none());
        Ok(())
    }

    #[test]
    fn remote_fetch_failure_is_surfaced_without_seeding() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.remote.set_offline(true);
        h.controller.on_session_change(SessionState::Authenticated(UserId::new("ada")));

        assert!(h.controller.notes().is_empty());
        assert!(!h.controller.is_loading());
        assert!(h.controller.last_error().is_some());
        Ok(())
    }

    #[test]
    fn login_copies_local_notes_to_remote() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        let x = h.controller.active_id().expect("seeded");
        h.controller.update_content(x, "from this device");
        let user = UserId::new("ada");
        assert!(h.remote.snapshot(&user).is_empty());

        h.credentials.set_sign_in_user(Some(user.clone()));
        assert_eq!(h.controller.login()?, user);
        let remote = h.remote.snapshot(&user);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].id, x);
        assert_eq!(remote[0].content, "from this device");

        h.controller.pump_session();
        assert_eq!(h.controller.session(), &SessionState::Authenticated(user));
        assert_eq!(h.controller.active_id(), Some(x));
        Ok(())
    }

    #[test]
    fn cancelled_login_keeps_local_session() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        assert!(h.controller.login().is_err());
        h.controller.pump_session();
        assert_eq!(h.controller.session(), &SessionState::Unauthenticated);
        Ok(())
    }

    #[test]
    fn logout_reloads_local_notes() -> anyhow::Result<()> {
        let mut h = signed_out()?;
        let local_id = h.controller.active_id().expect("seeded");
        let user = UserId::new("ada");
        h.remote.seed(
            &user,
            [Note {
                id: 1,
                title: "cloud".into(),
                content: "cloud".into(),
            }],
        );
        h.credentials.set_sign_in_user(Some(user));
        h.controller.login()?;
        h.controller.pump_session();
        assert_eq!(h.controller.notes().len(), 2);

        h.controller.logout()?;
        h.controller.pump_session();
        assert_eq!(h.controller.session(), &SessionState::Unauthenticated);
        assert_eq!(h.controller.notes().ids(), vec![local_id]);
        Ok(())
    }

    #[test]
    fn writes_queued_before_a_session_switch_are_discarded() -> anyhow::Result<()> {
        let mut h = harness()?;
        let ada = UserId::new("ada");
        h.controller.on_session_change(SessionState::Authenticated(ada.clone()));
        assert!(h.controller.flush_remote_within(Duration::from_secs(5)));
        let events = h.controller.sync_events();
        events.try_iter().for_each(drop);

        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        h.remote.set_write_hook(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        h.controller.add_note();
        h.controller.on_session_change(SessionState::Unauthenticated);
        release_tx.send(())?;
        assert!(h.controller.flush_remote_within(Duration::from_secs(5)));

        let outcomes: Vec<_> = events.try_iter().collect();
        assert!(outcomes
            .iter()
            .any(|event| matches!(event, SyncEvent::Discarded { .. })));
        assert!(matches!(h.controller.sync_status(), SyncStatus::Error { .. }));
        Ok(())
    }

    #[test]
    fn logout_lets_pending_edits_reach_the_remote() -> anyhow::Result<()> {
        let mut h = harness()?;
        let ada = UserId::new("ada");
        h.controller.on_session_change(SessionState::Authenticated(ada.clone()));
        assert!(h.controller.flush_remote_within(Duration::from_secs(5)));
        let id = h.controller.active_id().expect("seeded note");

        h.remote.set_write_hook(|| std::thread::sleep(Duration::from_millis(50)));
        h.controller.update_content(id, "important edit");
        h.controller.logout()?;
        h.controller.pump_session();
        assert_eq!(h.controller.session(), &SessionState::Unauthenticated);

        let remote = h.remote.snapshot(&ada);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].content, "important edit");
        assert!(matches!(h.controller.sync_status(), SyncStatus::Idle));
        Ok(())
    }
}
