//! Analysis-notification rendering.
//!
//! Kept deliberately small — the full report renderer is an external
//! collaborator; this produces the notification body with the summary text
//! inline.

/// Subject + HTML body for one analysis notification.
pub fn render_analysis_email(
    symbol: &str,
    name: &str,
    quarter: i64,
    year: i64,
    output_text: &str,
) -> (String, String) {
    let subject = format!("{symbol} Q{quarter} {year} earnings call summary");

    let mut body = String::with_capacity(output_text.len() + 512);
    body.push_str("<html><body>");
    body.push_str(&format!(
        "<h2>{} ({}) — Q{} {}</h2>",
        escape_html(name),
        escape_html(symbol),
        quarter,
        year
    ));
    for paragraph in output_text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        body.push_str("<p>");
        body.push_str(&escape_html(paragraph).replace('\n', "<br/>"));
        body.push_str("</p>");
    }
    body.push_str("</body></html>");

    (subject, body)
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
