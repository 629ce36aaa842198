pub mod app;
pub mod cli;
pub mod config;
pub mod remote;
pub mod session;
pub mod storage;
pub mod sync;

pub use app::{Collaborators, Note, NoteCollection, NoteController, NoteId};
pub use config::{AppConfig, ConfigLoader, ConfigPaths};
