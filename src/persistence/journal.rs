//! Append-only JSON-lines journal.
//!
//! Each write appends one self-describing line and flushes. On open the file
//! is replayed into an in-memory [`Ledger`] that serves `get_game`.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::memory::Ledger;
use super::{
    ChatRecord, GameRecord, GameStatusUpdate, PersistenceError, PersistenceGateway, RoundRecord,
};
use crate::core::ids::GameId;

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEntry {
    Round(RoundRecord),
    Status {
        game_id: GameId,
        update: GameStatusUpdate,
    },
    Chat(ChatRecord),
}

/// File-backed gateway.
#[derive(Debug)]
pub struct JournalGateway {
    path: PathBuf,
    writer: BufWriter<File>,
    ledger: Ledger,
}

impl JournalGateway {
    /// Open (or create) the journal at `path` and replay it.
    ///
    /// Lines that fail to parse are skipped with a warning so one torn write
    /// at the tail does not lose the rest of the history.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }

        let mut ledger = Ledger::default();
        let mut replayed = 0usize;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(&line) {
                    Ok(entry) => {
                        apply(&mut ledger, entry);
                        replayed += 1;
                    }
                    Err(e) => warn!(line = lineno + 1, error = %e, "Skipping corrupt journal line"),
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), entries = replayed, "Journal opened");

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            ledger,
        })
    }

    /// Journal file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, entry: JournalEntry) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(&entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        apply(&mut self.ledger, entry);
        Ok(())
    }
}

fn apply(ledger: &mut Ledger, entry: JournalEntry) {
    match entry {
        JournalEntry::Round(round) => ledger.record_round(round),
        JournalEntry::Status { game_id, update } => ledger.update_game_status(&game_id, update),
        JournalEntry::Chat(chat) => ledger.record_chat(chat),
    }
}

impl PersistenceGateway for JournalGateway {
    fn record_round(&mut self, round: RoundRecord) -> Result<(), PersistenceError> {
        self.append(JournalEntry::Round(round))
    }

    fn update_game_status(
        &mut self,
        game_id: &GameId,
        update: GameStatusUpdate,
    ) -> Result<(), PersistenceError> {
        self.append(JournalEntry::Status {
            game_id: game_id.clone(),
            update,
        })
    }

    fn get_game(&self, game_id: &GameId) -> Result<Option<GameRecord>, PersistenceError> {
        Ok(self.ledger.game(game_id).cloned())
    }

    fn record_chat(&mut self, chat: ChatRecord) -> Result<(), PersistenceError> {
        self.append(JournalEntry::Chat(chat))
    }
}
