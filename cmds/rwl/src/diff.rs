//! Diff rendering and user consent.
//!
//! Renders a line-numbered diff between the cluster state and the proposed
//! resource, then asks for confirmation unless the apply was pre-approved.

use std::io::{self, BufRead, IsTerminal, Write};

use clap::ValueEnum;
use nu_ansi_term::Color;
use similar::{ChangeTag, TextDiff};

/// Controls ANSI colorization of the diff output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorMode {
	/// Colorize when stdout is a terminal.
	#[default]
	Auto,
	Always,
	Never,
}

impl ColorMode {
	pub fn should_colorize(&self) -> bool {
		match self {
			ColorMode::Auto => io::stdout().is_terminal(),
			ColorMode::Always => true,
			ColorMode::Never => false,
		}
	}
}

/// Writes line-numbered diffs with optional color.
pub struct DiffOutput<W: Write> {
	writer: W,
	use_color: bool,
}

impl<W: Write> DiffOutput<W> {
	pub fn new(writer: W, use_color: bool) -> Self {
		Self { writer, use_color }
	}

	/// Render the difference between two canonical documents.
	///
	/// Context lines carry both line numbers, deletions the left number with
	/// `-`, insertions the right number with `+`. Elided runs between change
	/// groups are marked with `...`.
	pub fn write_diff(&mut self, current: &str, proposed: &str) -> io::Result<()> {
		let diff = TextDiff::from_lines(current, proposed);
		for (group_idx, group) in diff.grouped_ops(3).iter().enumerate() {
			if group_idx > 0 {
				writeln!(self.writer, "...")?;
			}
			for op in group {
				for change in diff.iter_changes(op) {
					let line = change.value().trim_end_matches('\n');
					let rendered = match change.tag() {
						ChangeTag::Equal => format!(
							"{:>4},{:>4}   {}",
							change.old_index().map(|i| i + 1).unwrap_or_default(),
							change.new_index().map(|i| i + 1).unwrap_or_default(),
							line
						),
						ChangeTag::Delete => {
							let text = format!(
								"{:>4}      - {}",
								change.old_index().map(|i| i + 1).unwrap_or_default(),
								line
							);
							self.paint(Color::Red, text)
						}
						ChangeTag::Insert => {
							let text = format!(
								"     {:>4} + {}",
								change.new_index().map(|i| i + 1).unwrap_or_default(),
								line
							);
							self.paint(Color::Green, text)
						}
					};
					writeln!(self.writer, "{}", rendered)?;
				}
			}
		}
		Ok(())
	}

	fn paint(&self, color: Color, text: String) -> String {
		if self.use_color {
			color.paint(text).to_string()
		} else {
			text
		}
	}
}

/// What the apply is about to do, for the consent prompt wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposedAction {
	Create,
	Update,
}

/// Ask the user to confirm the proposed change.
///
/// Accepts `y`, `yes`, `n`, `no` case-insensitively and re-prompts on
/// anything else. End of input counts as a rejection, so a non-interactive
/// run without pre-approval never mutates the cluster.
pub fn confirm(
	input: &mut dyn BufRead,
	output: &mut dyn Write,
	action: ProposedAction,
	name: &str,
) -> io::Result<bool> {
	let prompt = match action {
		ProposedAction::Create => "Do you want to create this workload? [yN] ".to_string(),
		ProposedAction::Update => format!("Really update the workload {name:?}? [yN] "),
	};
	loop {
		write!(output, "{prompt}")?;
		output.flush()?;

		let mut line = String::new();
		if input.read_line(&mut line)? == 0 {
			return Ok(false);
		}
		match line.trim().to_lowercase().as_str() {
			"y" | "yes" => return Ok(true),
			"n" | "no" => return Ok(false),
			_ => writeln!(output, "invalid input (not y, n, yes, or no)")?,
		}
	}
}
