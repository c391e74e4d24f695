use std::fmt::Write as _;

use {anyhow::Result, clap::Subcommand, wagate_sessions::SessionRecord};

#[derive(Subcommand)]
pub enum SessionAction {
    /// List persisted sessions from the metadata database.
    List {
        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

pub async fn handle_sessions(action: SessionAction) -> Result<()> {
    match action {
        SessionAction::List { json } => {
            let config = wagate_config::discover_and_load();
            let metadata = wagate_gateway::open_metadata(&config).await?;
            let records = metadata.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print!("{}", render_table(&records));
            }
            Ok(())
        },
    }
}

fn render_table(records: &[SessionRecord]) -> String {
    if records.is_empty() {
        return "no sessions\n".into();
    }
    let id_width = records.iter().map(|r| r.id.len()).max().unwrap_or(0).max(2);
    let phone_width = records
        .iter()
        .map(|r| r.best_phone().len())
        .max()
        .unwrap_or(0)
        .max(5);

    let mut out = String::new();
    let _ = writeln!(out, "{:<id_width$}  {:<phone_width$}  {:>3}  NAME  WEBHOOK", "ID", "PHONE", "POS");
    for r in records {
        let webhook = if r.webhook_url.is_empty() {
            "-"
        } else {
            r.webhook_url.as_str()
        };
        let _ = writeln!(
            out,
            "{:<id_width$}  {:<phone_width$}  {:>3}  {}  {}",
            r.id,
            r.best_phone(),
            r.position,
            r.name,
            webhook
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table() {
        assert_eq!(render_table(&[]), "no sessions\n");
    }

    #[test]
    fn table_prefers_resolved_phone() {
        let mut a = SessionRecord::new("9999999999", "Sales", "https://hooks.example/a");
        a.actual_phone = Some("6281234567890".into());
        let b = SessionRecord::new("12345", "", "");
        let table = render_table(&[a, b]);

        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].contains("6281234567890"));
        assert!(lines[1].contains("https://hooks.example/a"));
        assert!(lines[2].starts_with("12345"));
        assert!(lines[2].ends_with('-'));
    }
}
