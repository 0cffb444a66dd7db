//! Terminal output for a running sync.

use crossbeam_channel::{select, tick};
use std::io::Write;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::sync::manager::{RunOutcome, RunReport};
use crate::sync::progress::{CompletionNotice, ProgressReader, ProgressSnapshot};
use crate::sync::Worklist;

const REFRESH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    /// Print every finished file
    pub verbose: bool,
    /// One JSON object per line instead of text
    pub json: bool,
}

/// Start the reporter thread. It exits when the notice stream closes.
pub fn spawn(reader: ProgressReader, options: ReportOptions) -> JoinHandle<()> {
    thread::spawn(move || {
        let ticker = tick(REFRESH);
        loop {
            select! {
                recv(reader.notices()) -> notice => match notice {
                    Ok(notice) => {
                        if options.verbose || notice.error.is_some() {
                            print_notice(&notice, options.json);
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => print_progress(&reader.snapshot(), options.json),
            }
        }
        print_progress(&reader.snapshot(), options.json);
        if !options.json {
            println!();
        }
    })
}

fn print_notice(notice: &CompletionNotice, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(&serde_json::json!({ "file": notice })) {
            println!("{}", line);
        }
        return;
    }
    match &notice.error {
        None => println!(
            "\r{} ({})",
            notice.source.display(),
            format_duration(notice.duration.as_secs())
        ),
        Some(e) => println!("\rFAILED {}: {}", notice.source.display(), e),
    }
}

fn print_progress(snapshot: &ProgressSnapshot, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(&serde_json::json!({ "progress": snapshot })) {
            println!("{}", line);
        }
        return;
    }
    print!("\r{}", progress_line(snapshot));
    let _ = std::io::stdout().flush();
}

pub fn progress_line(s: &ProgressSnapshot) -> String {
    format!(
        "{}/{} done, {} errors | {} elapsed, {} left | {:.1}/min | ratio {:.0}% | ~{} free",
        s.completed,
        s.total,
        s.errors,
        format_duration(s.elapsed_secs as u64),
        format_duration(s.remaining_secs as u64),
        s.throughput,
        s.compression * 100.0,
        format_signed_bytes(s.estimated_free_space),
    )
}

/// Describe the planned work before asking for confirmation.
pub fn print_plan(worklist: &Worklist, initial: bool) {
    let dirs = worklist.directories().count();
    let files = worklist.files().count();
    if initial {
        println!("Initial sync: the target will be cleared first.");
    }
    println!(
        "{} directories to update, {} files to convert or copy ({})",
        dirs,
        files,
        format_bytes(worklist.total_source_bytes())
    );
    if worklist.scan_errors > 0 {
        println!("{} directories could not be read and were skipped", worklist.scan_errors);
    }
}

pub fn print_summary(outcome: &RunOutcome, json: bool) {
    if json {
        let value = match outcome {
            RunOutcome::NothingToDo => serde_json::json!({ "result": "nothing_to_do" }),
            RunOutcome::Done(report) => serde_json::json!({ "result": "done", "report": report }),
            RunOutcome::Stopped(report) => {
                serde_json::json!({ "result": "stopped", "report": report })
            }
        };
        println!("{}", value);
        return;
    }

    match outcome {
        RunOutcome::NothingToDo => println!("Nothing to do, the target is up to date."),
        RunOutcome::Done(report) => {
            println!(
                "Done: {} items processed in {}, {} errors.",
                report.completed,
                format_duration(report.elapsed_secs as u64),
                report.errors
            );
            print_error_hint(report);
        }
        RunOutcome::Stopped(report) => {
            println!(
                "Stopped: {} items processed, {} remaining, {} errors.",
                report.completed, report.remaining, report.errors
            );
            print_error_hint(report);
        }
    }
}

fn print_error_hint(report: &RunReport) {
    if let Some(dir) = &report.error_dir {
        println!("Encoder logs for failed files are in {}", dir.display());
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1_048_576 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1_073_741_824 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    }
}

fn format_signed_bytes(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", format_bytes(bytes.unsigned_abs()))
    } else {
        format_bytes(bytes as u64)
    }
}

fn format_duration(seconds: u64) -> String {
    humantime::format_duration(Duration::from_secs(seconds)).to_string()
}
