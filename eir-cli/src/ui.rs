// Rendering: raster (instants on X, probe channels on Y) + status panel.

use std::io::Stdout;

use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    text::Text,
    widgets::{Block, Borders, Paragraph},
    Terminal,
};

use crate::app::App;
use crate::backend::RasterBackend;

pub fn draw<B: RasterBackend>(terminal: &mut Terminal<CrosstermBackend<Stdout>>, app: &App<B>) -> anyhow::Result<()> {
    terminal.draw(|f| {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([Constraint::Percentage(80), Constraint::Percentage(20)].as_ref())
            .split(f.size());

        let pad = app.labels.iter().map(String::len).max().unwrap_or(0);
        let lines: Vec<String> = app
            .labels
            .iter()
            .zip(&app.raster)
            .map(|(label, row)| {
                let mut line = format!("{label:>pad$} |");
                line.extend(row.iter());
                line
            })
            .collect();

        let raster = Paragraph::new(Text::from(lines.join("\n")))
            .block(Block::default().title("Raster  (instants →)").borders(Borders::ALL))
            .style(Style::default().fg(Color::White));
        f.render_widget(raster, chunks[0]);

        let t = app
            .backend
            .now()
            .map_or_else(|| "-".to_string(), |ns| format!("{:.3} ms", ns as f64 / 1e6));
        let state = match (&app.error, app.done, app.running) {
            (Some(e), _, _) => format!("failed: {e}"),
            (None, true, _) => "done".to_string(),
            (None, false, true) => "running".to_string(),
            (None, false, false) => "paused".to_string(),
        };
        let status = format!(
            "Source: {} | t: {} | Instants: {} | Rows: {} | {}\nControls: [s] Step  [r] Run/Pause  [q] Quit",
            app.backend.source(),
            t,
            app.instants,
            app.labels.len(),
            state
        );
        let status = Paragraph::new(status)
            .style(Style::default().fg(if app.error.is_some() { Color::Red } else { Color::Cyan }))
            .block(Block::default().title("Status").borders(Borders::ALL));
        f.render_widget(status, chunks[1]);
    })?;
    Ok(())
}
