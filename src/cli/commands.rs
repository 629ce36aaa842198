use std::fmt::Write as _;
use std::io::{self, Read};

use anyhow::{bail, Context, Result};
use clap::Args;

use crate::app::{NoteController, NoteId};
use crate::session::{FileCredentialProvider, SessionState, UserId};
use crate::sync::SyncStatus;

#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    /// Note identifier (defaults to the active note)
    pub id: Option<NoteId>,
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    /// Initial content for the new note
    #[arg(long)]
    pub content: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Note identifier
    pub id: NoteId,
    /// New content. If omitted, reads from stdin.
    #[arg(long)]
    pub content: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct SelectArgs {
    /// Note identifier
    pub id: NoteId,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Note identifier
    pub id: NoteId,
    /// Skip the confirmation prompt
    #[arg(long, short)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MoveArgs {
    /// Current tab position
    pub from: usize,
    /// Target tab position
    pub to: usize,
}

#[derive(Args, Debug, Clone)]
pub struct StampArgs {
    /// Note to stamp (defaults to the active note)
    pub id: Option<NoteId>,
}

#[derive(Args, Debug, Clone)]
pub struct LoginArgs {
    /// User to sign in as
    pub user: String,
}

const SIGNED_IN_NOTICE: &str =
    "note: tab order and the active note are not stored remotely; the next run starts at the first note\n";

/// Remote collections come back ordered by id with the first note active.
fn with_signed_in_notice(controller: &NoteController, mut out: String) -> String {
    if controller.session().user().is_some() {
        out.push_str(SIGNED_IN_NOTICE);
    }
    out
}

pub fn list(controller: &NoteController) -> String {
    let notes = controller.notes();
    if notes.is_empty() {
        return "No open notes. Run `notesync add` to create one.\n".to_string();
    }
    let active = controller.active_id();
    let mut out = String::new();
    for (index, note) in notes.iter().enumerate() {
        let marker = if Some(note.id) == active { '*' } else { ' ' };
        let _ = writeln!(&mut out, "{marker} {index:>2}  #{}  {}", note.id, note.title);
    }
    out
}

pub fn show(controller: &NoteController, args: ShowArgs) -> Result<String> {
    let note = match args.id {
        Some(id) => controller.notes().get(id),
        None => controller.active_note(),
    };
    let Some(note) = note else {
        bail!("no such note");
    };
    let mut out = note.content.clone();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

pub fn add(controller: &mut NoteController, args: AddArgs) -> Result<String> {
    let id = controller.add_note();
    if let Some(content) = args.content {
        controller.update_content(id, content);
    }
    Ok(format!("Created note #{id}\n"))
}

pub fn edit(controller: &mut NoteController, args: EditArgs) -> Result<String> {
    let content = match args.content {
        Some(content) => content,
        None => read_stdin()?.unwrap_or_default(),
    };
    if !controller.update_content(args.id, content) {
        bail!("note #{} does not exist", args.id);
    }
    let title = controller
        .notes()
        .get(args.id)
        .map(|note| note.title.clone())
        .unwrap_or_default();
    Ok(format!("Updated note #{} ({title})\n", args.id))
}

pub fn select(controller: &mut NoteController, args: SelectArgs) -> Result<String> {
    if !controller.select_note(args.id) {
        bail!("note #{} does not exist", args.id);
    }
    Ok(with_signed_in_notice(
        controller,
        format!("Active note is now #{}\n", args.id),
    ))
}

pub fn delete(controller: &mut NoteController, args: DeleteArgs) -> Result<String> {
    if !controller.notes().contains(args.id) {
        bail!("note #{} does not exist", args.id);
    }
    if !controller.delete_note(args.id) {
        return Ok("Delete cancelled.\n".to_string());
    }
    let mut out = format!("Deleted note #{}\n", args.id);
    match controller.active_id() {
        Some(active) => {
            let _ = writeln!(&mut out, "Active note is now #{active}");
        }
        None => out.push_str("No notes left.\n"),
    }
    Ok(out)
}

pub fn move_tab(controller: &mut NoteController, args: MoveArgs) -> Result<String> {
    let len = controller.notes().len();
    if !controller.reorder(args.from, args.to) {
        bail!(
            "positions must be below {len} (got {} -> {})",
            args.from,
            args.to
        );
    }
    Ok(with_signed_in_notice(controller, list(controller)))
}

pub fn stamp(controller: &mut NoteController, args: StampArgs) -> Result<String> {
    if let Some(id) = args.id {
        if !controller.select_note(id) {
            bail!("note #{id} does not exist");
        }
    }
    if !controller.insert_timestamp() {
        bail!("no active note to stamp");
    }
    let id = controller.active_id().unwrap_or_default();
    Ok(format!("Stamped note #{id}\n"))
}

pub fn login(
    controller: &mut NoteController,
    credentials: &FileCredentialProvider,
    args: LoginArgs,
) -> Result<String> {
    let user = args.user.trim();
    if user.is_empty() {
        bail!("user cannot be empty");
    }
    credentials.set_sign_in_user(UserId::new(user));
    let user = controller.login().context("logging in")?;
    controller.pump_session();
    Ok(format!(
        "Signed in as {user}; {} note(s) in your collection\n",
        controller.notes().len()
    ))
}

pub fn logout(controller: &mut NoteController) -> Result<String> {
    if controller.session().user().is_none() {
        return Ok("Not signed in.\n".to_string());
    }
    controller.logout().context("logging out")?;
    controller.pump_session();
    Ok(format!(
        "Signed out; {} local note(s)\n",
        controller.notes().len()
    ))
}

pub fn status(controller: &NoteController) -> String {
    let mut out = String::new();
    let session = match controller.session() {
        SessionState::Resolving => "resolving".to_string(),
        SessionState::Unauthenticated => "signed out (local notes)".to_string(),
        SessionState::Authenticated(user) => format!("signed in as {user}"),
    };
    let _ = writeln!(&mut out, "session  {session}");
    let _ = writeln!(&mut out, "notes    {}", controller.notes().len());
    match controller.active_note() {
        Some(note) => {
            let _ = writeln!(&mut out, "active   #{} {}", note.id, note.title);
        }
        None => {
            let _ = writeln!(&mut out, "active   none");
        }
    }
    let sync = match controller.sync_status() {
        SyncStatus::Idle => "idle".to_string(),
        SyncStatus::Pending { queued } => format!("{queued} write(s) pending"),
        SyncStatus::Error { message, .. } => format!("error: {message}"),
    };
    let _ = writeln!(&mut out, "sync     {sync}");
    if let Some(error) = controller.last_error() {
        let _ = writeln!(&mut out, "warning  {error}");
    }
    out
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .context("reading note content from stdin")?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AlwaysConfirm, Collaborators};
    use crate::config::AppConfig;
    use crate::remote::MemoryDocumentStore;
    use crate::session::StaticCredentialProvider;
    use crate::storage::MemoryLocalStore;
    use std::sync::Arc;

    fn controller() -> anyhow::Result<NoteController> {
        let mut controller = NoteController::new(
            &AppConfig::default(),
            Collaborators {
                local: Arc::new(MemoryLocalStore::new()),
                remote: Arc::new(MemoryDocumentStore::new()),
                credentials: Arc::new(StaticCredentialProvider::new(
                    SessionState::Unauthenticated,
                )),
                confirm: Box::new(AlwaysConfirm),
            },
        )?;
        controller.pump_session();
        Ok(controller)
    }

    #[test]
    fn list_marks_active_tab() -> anyhow::Result<()> {
        let mut controller = controller()?;
        let first = controller.active_id().expect("seeded");
        add(
            &mut controller,
            AddArgs {
                content: Some("shopping\nmilk".into()),
            },
        )?;
        let second = controller.active_id().expect("added");

        let listing = list(&controller);
        assert_eq!(
            listing,
            format!("   0  #{first}  Untitled Note\n*  1  #{second}  shopping\n")
        );
        Ok(())
    }

    #[test]
    fn move_rejects_out_of_range_positions() -> anyhow::Result<()> {
        let mut controller = controller()?;
        let err = move_tab(&mut controller, MoveArgs { from: 0, to: 4 }).unwrap_err();
        assert!(err.to_string().contains("below 1"));
        Ok(())
    }

    #[test]
    fn delete_of_last_note_reports_empty_collection() -> anyhow::Result<()> {
        let mut controller = controller()?;
        let id = controller.active_id().expect("seeded");
        let out = delete(&mut controller, DeleteArgs { id, yes: true })?;
        assert_eq!(out, format!("Deleted note #{id}\nNo notes left.\n"));
        assert!(list(&controller).starts_with("No open notes"));
        Ok(())
    }

    fn signed_in_controller() -> anyhow::Result<NoteController> {
        let mut controller = NoteController::new(
            &AppConfig::default(),
            Collaborators {
                local: Arc::new(MemoryLocalStore::new()),
                remote: Arc::new(MemoryDocumentStore::new()),
                credentials: Arc::new(StaticCredentialProvider::new(
                    SessionState::Authenticated(UserId::new("ada")),
                )),
                confirm: Box::new(AlwaysConfirm),
            },
        )?;
        controller.pump_session();
        Ok(controller)
    }

    #[test]
    fn select_and_move_warn_that_order_is_local_when_signed_in() -> anyhow::Result<()> {
        let mut local = controller()?;
        let id = local.active_id().expect("seeded");
        let out = select(&mut local, SelectArgs { id })?;
        assert!(!out.contains(SIGNED_IN_NOTICE));

        let mut signed_in = signed_in_controller()?;
        let first = signed_in.active_id().expect("seeded");
        add(&mut signed_in, AddArgs { content: None })?;

        let out = select(&mut signed_in, SelectArgs { id: first })?;
        assert!(out.ends_with(SIGNED_IN_NOTICE));
        let out = move_tab(&mut signed_in, MoveArgs { from: 0, to: 1 })?;
        assert!(out.ends_with(SIGNED_IN_NOTICE));
        Ok(())
    }

    #[test]
    fn stamp_targets_the_requested_note() -> anyhow::Result<()> {
        let mut signed_in = signed_in_controller()?;
        let first = signed_in.active_id().expect("seeded");
        add(&mut signed_in, AddArgs { content: None })?;
        select(&mut signed_in, SelectArgs { id: first })?;
        let second = signed_in.notes().ids()[1];

        let out = stamp(&mut signed_in, StampArgs { id: Some(second) })?;
        assert_eq!(out, format!("Stamped note #{second}\n"));
        assert!(!signed_in.notes().get(second).expect("second").content.is_empty());
        assert!(signed_in.notes().get(first).expect("first").content.is_empty());
        assert!(stamp(&mut signed_in, StampArgs { id: Some(-1) }).is_err());
        Ok(())
    }

    #[test]
    fn status_describes_local_session() -> anyhow::Result<()> {
        let controller = controller()?;
        let out = status(&controller);
        assert!(out.contains("session  signed out (local notes)"));
        assert!(out.contains("notes    1"));
        assert!(out.contains("sync     idle"));
        Ok(())
    }
}
