//! Client-side CSV import: `crm import <kind> <file>`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

use crm::app::import::{ImportKind, ImportPayload, ImportReport, RowSink, parse_csv, run_import};
use crm::client::{CrmClient, HttpSink};

/// Ticks a progress bar after every submitted row.
struct ProgressSink<S> {
    inner: S,
    bar: ProgressBar,
}

#[async_trait]
impl<S: RowSink> RowSink for ProgressSink<S> {
    async fn submit(&self, payload: ImportPayload) -> Result<(), String> {
        let result = self.inner.submit(payload).await;
        self.bar.inc(1);
        result
    }
}

pub async fn cmd_import(
    kind: ImportKind,
    file: &Path,
    server: &str,
    token: &str,
    upload: bool,
) -> Result<()> {
    let input = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let client = CrmClient::new(server, token);
    let me = client.me().await.context("Could not authenticate against the server")?;
    println!(
        "Importing {} into {} as {}",
        style(kind).bold(),
        style(&me.organization.name).cyan(),
        me.user.email
    );

    let report = if upload {
        client.import(kind, input).await?
    } else {
        let template = kind.template();
        let table = parse_csv(&input, template)?;

        let bar = ProgressBar::new(table.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len}")
                .context("invalid progress template")?
                .progress_chars("█▓▒░"),
        );
        bar.set_prefix("Rows");
        let sink = ProgressSink {
            inner: HttpSink::new(client),
            bar: bar.clone(),
        };
        let report = run_import(template, &table, &sink).await;
        bar.finish_and_clear();
        report
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &ImportReport) {
    println!(
        "{} {} of {} rows imported",
        style("✓").green(),
        style(report.imported).bold(),
        report.total_rows
    );
    if !report.errors.is_empty() {
        println!("{}", style(format!("{} rows rejected:", report.errors.len())).red().bold());
        for error in &report.errors {
            println!("  line {:>4}: {}", error.line, error.message);
        }
    }
}
