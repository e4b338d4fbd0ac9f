//! Choosing which backup to restore

use crate::model::Backup;
use crate::{Error, Result};
use std::io::{self, BufRead, Write};

/// Picks one backup out of the candidates known to the index.
pub trait BackupSelector {
    fn select_one(&mut self, candidates: &[Backup]) -> Result<Backup>;
}

/// Selects the backup with a fixed id, as given by `--id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSelection(pub i64);

impl BackupSelector for FixedSelection {
    fn select_one(&mut self, candidates: &[Backup]) -> Result<Backup> {
        candidates
            .iter()
            .find(|b| b.id == self.0)
            .cloned()
            .ok_or(Error::BackupNotFound { id: self.0 })
    }
}

const MAX_ATTEMPTS: usize = 3;

/// Interactive picker: prints a numbered list and reads the answer.
///
/// The answer may be a list number or a case-insensitive fragment of a backup
/// name that matches exactly one candidate. A single candidate is chosen
/// without prompting.
pub struct TerminalSelector<R, W> {
    input: R,
    output: W,
}

impl TerminalSelector<io::StdinLock<'static>, io::Stderr> {
    /// Prompt on stderr, read from stdin
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> TerminalSelector<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn prompt(&mut self, candidates: &[Backup]) -> io::Result<Option<String>> {
        writeln!(self.output, "Available backups:")?;
        for (i, backup) in candidates.iter().enumerate() {
            write!(
                self.output,
                "  [{}] {} (id {}, created {})",
                i + 1,
                backup.name,
                backup.id,
                backup.created.format("%Y-%m-%d %H:%M:%S")
            )?;
            if !backup.description.is_empty() {
                write!(self.output, " - {}", backup.description)?;
            }
            writeln!(self.output)?;
        }
        write!(self.output, "Select a backup [1-{}]: ", candidates.len())?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl<R: BufRead, W: Write> BackupSelector for TerminalSelector<R, W> {
    fn select_one(&mut self, candidates: &[Backup]) -> Result<Backup> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        match sorted.len() {
            0 => return Err(Error::NoBackups),
            1 => return Ok(sorted.remove(0)),
            _ => {}
        }

        let terminal = |e: io::Error| Error::Selection {
            reason: e.to_string(),
        };

        for _ in 0..MAX_ATTEMPTS {
            let Some(answer) = self.prompt(&sorted).map_err(terminal)? else {
                return Err(Error::Selection {
                    reason: "input closed before a backup was chosen".to_string(),
                });
            };

            match resolve_answer(&sorted, &answer) {
                Ok(index) => return Ok(sorted.swap_remove(index)),
                Err(reason) => writeln!(self.output, "{reason}").map_err(terminal)?,
            }
        }

        Err(Error::Selection {
            reason: format!("no valid choice after {MAX_ATTEMPTS} attempts"),
        })
    }
}

fn resolve_answer(candidates: &[Backup], answer: &str) -> std::result::Result<usize, String> {
    if answer.is_empty() {
        return Err("Please enter a number or part of a backup name".to_string());
    }

    if let Ok(number) = answer.parse::<usize>() {
        return if (1..=candidates.len()).contains(&number) {
            Ok(number - 1)
        } else {
            Err(format!("{number} is not between 1 and {}", candidates.len()))
        };
    }

    let needle = answer.to_lowercase();
    let matches: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, b)| b.name.to_lowercase().contains(&needle))
        .map(|(i, _)| i)
        .collect();

    match matches.as_slice() {
        [index] => Ok(*index),
        [] => Err(format!("No backup name contains '{answer}'")),
        _ => Err(format!("'{answer}' matches {} backups", matches.len())),
    }
}
