use client_core::dispatch::{ChunkRenderer, RenderContext};
use protocol::chunk::{
    display_value, Action, ActionCard, AggregatedCard, DataTable, ErrorCard, FieldKind, FormCard,
    ListCard, Severity, TextBlock, Tone,
};

/// Plain-text rendering of chunks for the terminal.
#[derive(Debug, Default)]
pub struct TerminalRenderer;

impl TerminalRenderer {
    fn actions_line(actions: &[Action]) -> Option<String> {
        let enabled: Vec<_> = actions
            .iter()
            .filter(|action| !action.disabled)
            .map(|action| format!("[{}] {}", action.id, action.label))
            .collect();
        (!enabled.is_empty()).then(|| format!("  actions: {}", enabled.join("  ")))
    }
}

impl ChunkRenderer for TerminalRenderer {
    type Output = String;

    fn text_block(&mut self, chunk: &TextBlock, _cx: &RenderContext<'_>) -> String {
        let marker = match chunk.tone {
            Tone::Neutral => "",
            Tone::Advisory => "(i) ",
            Tone::Warning => "(!) ",
        };
        let suffix = if chunk.completed { "" } else { " ..." };
        format!("{marker}{}{suffix}", chunk.content)
    }

    fn aggregated_card(&mut self, chunk: &AggregatedCard, _cx: &RenderContext<'_>) -> String {
        let mut lines = vec![format!("== {} ==", chunk.title)];
        for item in &chunk.items {
            lines.push(format!("  {}: {}", item.label, display_value(&item.value)));
        }
        if chunk.show_sources && !chunk.sources.is_empty() {
            lines.push(format!("  sources: {}", chunk.sources.join(", ")));
        }
        lines.join("\n")
    }

    fn data_table(&mut self, chunk: &DataTable, _cx: &RenderContext<'_>) -> String {
        let rows: Vec<Vec<String>> = chunk
            .rows
            .iter()
            .map(|row| row.iter().map(display_value).collect())
            .collect();
        let mut widths: Vec<usize> = chunk.headers.iter().map(|h| h.chars().count()).collect();
        for row in &rows {
            for (column, cell) in row.iter().enumerate() {
                let width = cell.chars().count();
                match widths.get_mut(column) {
                    Some(current) => *current = (*current).max(width),
                    None => widths.push(width),
                }
            }
        }

        let format_row = |cells: &[String]| {
            cells
                .iter()
                .enumerate()
                .map(|(column, cell)| format!("{cell:<width$}", width = widths[column]))
                .collect::<Vec<_>>()
                .join(" | ")
        };
        let mut lines = vec![format_row(chunk.headers.as_slice())];
        lines.push(
            widths
                .iter()
                .take(chunk.headers.len())
                .map(|width| "-".repeat(*width))
                .collect::<Vec<_>>()
                .join("-+-"),
        );
        lines.extend(rows.iter().map(|row| format_row(row.as_slice())));
        lines.join("\n")
    }

    fn list_card(&mut self, chunk: &ListCard, _cx: &RenderContext<'_>) -> String {
        let mut lines = vec![format!("== {} ==", chunk.title)];
        for item in &chunk.items {
            match &item.subtitle {
                Some(subtitle) => lines.push(format!("  - {} ({subtitle})", item.title)),
                None => lines.push(format!("  - {}", item.title)),
            }
            if let Some(actions) = Self::actions_line(&item.actions) {
                lines.push(format!("  {actions}"));
            }
        }
        lines.join("\n")
    }

    fn action_card(&mut self, chunk: &ActionCard, _cx: &RenderContext<'_>) -> String {
        let mut lines = vec![format!("== {} ==", chunk.title)];
        if !chunk.description.is_empty() {
            lines.push(format!("  {}", chunk.description));
        }
        lines.extend(Self::actions_line(&chunk.actions));
        lines.join("\n")
    }

    fn form_card(&mut self, chunk: &FormCard, _cx: &RenderContext<'_>) -> String {
        let mut lines = vec![format!("== {} (form {}) ==", chunk.title, chunk.form_id())];
        for field in &chunk.fields {
            let required = if field.required { "*" } else { "" };
            let mut line = format!("  {}{required} [{}]", field.label, field.id);
            if field.kind == FieldKind::Select && !field.options.is_empty() {
                let options: Vec<_> = field.options.iter().map(|o| o.value.as_str()).collect();
                line.push_str(&format!(" one of: {}", options.join(", ")));
            }
            lines.push(line);
        }
        lines.push(format!("  submit: [{}] {}", chunk.submit_action.id, chunk.submit_action.label));
        lines.join("\n")
    }

    fn error_card(&mut self, chunk: &ErrorCard, _cx: &RenderContext<'_>) -> String {
        let label = match chunk.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "CRITICAL",
        };
        let mut lines = vec![format!("!! {label}: {}", chunk.title), format!("   {}", chunk.message)];
        lines.extend(Self::actions_line(&chunk.actions));
        lines.join("\n")
    }
}
