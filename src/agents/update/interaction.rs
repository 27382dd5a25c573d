use crate::agents::change_classifier::FileChange;
use crate::error::{Result, UpdaterError};
use colored::Colorize;
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

/// What the user chose to apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub files: Vec<FileChange>,
    pub apps: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.apps.is_empty()
    }
}

enum Item<'a> {
    File(&'a FileChange),
    App(&'a str),
}

fn file_note(file: &FileChange) -> &'static str {
    if file.is_module_file {
        " (module update required)"
    } else if file.requires_rebuild {
        " (requires recompile)"
    } else {
        ""
    }
}

/// Prompts for the interactive CLI mode.
///
/// Reads answers from any `BufRead` so the prompts can be driven from tests.
pub struct UpdateInteraction<R, W> {
    input: R,
    output: W,
}

impl UpdateInteraction<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> UpdateInteraction<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Read one trimmed, lower-cased answer. End of input reads as `None`.
    fn read_answer(&mut self) -> Result<Option<String>> {
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_lowercase()))
    }

    fn describe(item: &Item<'_>, reinstall: &HashSet<String>) -> String {
        match item {
            Item::File(file) => format!("{}{}", file.path, file_note(file)),
            Item::App(app) if reinstall.contains(*app) => format!("{app} (will reinstall)"),
            Item::App(app) => app.to_string(),
        }
    }

    /// Let the user toggle individual updates. Everything starts selected.
    ///
    /// Returns `UserCancelled` on `quit`.
    pub fn select(
        &mut self,
        files: &[FileChange],
        apps: &[String],
        reinstall: &HashSet<String>,
    ) -> Result<Selection> {
        let items: Vec<Item<'_>> = files
            .iter()
            .map(Item::File)
            .chain(apps.iter().map(|a| Item::App(a.as_str())))
            .collect();
        let mut selected = vec![true; items.len()];

        writeln!(self.output, "\n{}", "Available Updates".cyan().bold())?;
        writeln!(self.output, "{}", "=".repeat(51))?;
        if !files.is_empty() {
            writeln!(self.output, "\n{}", "File Updates:".yellow())?;
        }
        for (i, item) in items.iter().enumerate() {
            if i == files.len() && !apps.is_empty() {
                writeln!(self.output, "\n{}", "App Updates:".yellow())?;
            }
            writeln!(self.output, "  [{}] {}", i + 1, Self::describe(item, reinstall))?;
        }

        writeln!(self.output, "\n{}", "-".repeat(50))?;
        writeln!(self.output, "Commands:")?;
        writeln!(self.output, "  <number>     - Toggle selection")?;
        writeln!(self.output, "  all          - Select all")?;
        writeln!(self.output, "  none         - Select none")?;
        writeln!(self.output, "  list         - Show current selection")?;
        writeln!(self.output, "  continue     - Proceed with selected items")?;
        writeln!(self.output, "  quit         - Exit without updating")?;

        loop {
            write!(self.output, "\n> ")?;
            let Some(answer) = self.read_answer()? else {
                return Err(UpdaterError::UserCancelled);
            };

            match answer.as_str() {
                "" | "c" | "continue" => break,
                "q" | "quit" | "exit" => {
                    writeln!(self.output, "{}", "Update cancelled.".yellow())?;
                    return Err(UpdaterError::UserCancelled);
                }
                "a" | "all" => {
                    selected.fill(true);
                    writeln!(self.output, "{}", "✓ All items selected".green())?;
                }
                "n" | "none" => {
                    selected.fill(false);
                    writeln!(self.output, "{}", "✓ All items deselected".green())?;
                }
                "l" | "list" => {
                    writeln!(self.output, "\n{}", "Current Selection:".cyan())?;
                    for (i, item) in items.iter().enumerate() {
                        let marker = if selected[i] { "[x]".green() } else { "[ ]".dimmed() };
                        writeln!(
                            self.output,
                            "  {marker} [{}] {}",
                            i + 1,
                            Self::describe(item, reinstall)
                        )?;
                    }
                    let count = selected.iter().filter(|s| **s).count();
                    writeln!(self.output, "\nSelected: {count}/{} items", items.len())?;
                }
                other => match other.parse::<usize>() {
                    Ok(n) if (1..=items.len()).contains(&n) => {
                        selected[n - 1] = !selected[n - 1];
                        let state = if selected[n - 1] { "selected" } else { "deselected" };
                        writeln!(self.output, "{}", format!("✓ Item {n} {state}").green())?;
                    }
                    Ok(_) => {
                        writeln!(
                            self.output,
                            "{}",
                            format!("Invalid number. Please enter 1-{}", items.len()).red()
                        )?;
                    }
                    Err(_) => {
                        writeln!(
                            self.output,
                            "{}",
                            "Unknown command. Type 'continue' to proceed or 'quit' to exit.".red()
                        )?;
                    }
                },
            }
        }

        let mut selection = Selection::default();
        for (item, chosen) in items.iter().zip(&selected) {
            if !chosen {
                continue;
            }
            match item {
                Item::File(file) => selection.files.push((*file).clone()),
                Item::App(app) => selection.apps.push(app.to_string()),
            }
        }
        Ok(selection)
    }

    /// Print what is about to be applied and warn about slow steps.
    pub fn print_summary(
        &mut self,
        files: &[FileChange],
        apps: &[String],
        reinstall: &HashSet<String>,
    ) -> Result<()> {
        writeln!(self.output, "\n{}", "Update Summary".cyan().bold())?;
        writeln!(self.output, "{}", "=".repeat(51))?;

        if !files.is_empty() {
            writeln!(self.output, "\n{}", "Files to update:".yellow())?;
            for file in files {
                writeln!(self.output, "  • {}{}", file.path, file_note(file))?;
            }
        }
        if !apps.is_empty() {
            writeln!(self.output, "\n{}", "Apps to update:".yellow())?;
            for app in apps {
                writeln!(self.output, "  • {}", Self::describe(&Item::App(app), reinstall))?;
            }
        }

        let module = files.iter().any(|f| f.is_module_file);
        let rebuild = files.iter().any(|f| f.requires_rebuild && !f.is_module_file);
        let note = match (module, rebuild) {
            (true, true) => Some("module dependency updates and recompilation"),
            (true, false) => Some("module dependency updates"),
            (false, true) => Some("recompilation"),
            (false, false) => None,
        };
        if let Some(note) = note {
            writeln!(
                self.output,
                "\n{}",
                format!("⚠ Some updates require {note}. This may take several minutes.").yellow()
            )?;
        }
        writeln!(self.output)?;
        Ok(())
    }

    /// Ask a yes/no question; anything but yes is no.
    pub fn confirm(&mut self, question: &str) -> Result<bool> {
        write!(self.output, "\n{} ", format!("{question} (y/N):").bold())?;
        Ok(matches!(
            self.read_answer()?.as_deref(),
            Some("y") | Some("yes")
        ))
    }

    pub fn offer_rollback(&mut self) -> Result<bool> {
        self.confirm("Would you like to rollback the changes?")
    }

    pub fn offer_retry(&mut self) -> Result<bool> {
        self.confirm("Would you like to retry the update?")
    }

    /// Give the user a moment to interrupt before anything changes.
    pub fn countdown(&mut self, seconds: u64, tick: Duration) -> Result<()> {
        write!(self.output, "\nStarting update in: ")?;
        for n in (1..=seconds).rev() {
            write!(self.output, "{n}... ")?;
            self.output.flush()?;
            thread::sleep(tick);
        }
        writeln!(self.output)?;
        Ok(())
    }
}
