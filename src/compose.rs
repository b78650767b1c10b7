//! Renders the subject, plain-text body and HTML body for a suggestion
//! notification. Pure and total: absent optional fields are left out.
use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::config::App;
use crate::model::NotificationPayload;

/// Product identity printed in headers and signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branding {
    pub app_name: String,
    pub support_email: String,
}

impl Branding {
    pub fn from_app(app: &App) -> Self {
        Self {
            app_name: app.app_name.clone(),
            support_email: app.support_email.clone(),
        }
    }
}

impl Default for Branding {
    fn default() -> Self {
        Self {
            app_name: "SugFlora".into(),
            support_email: "suporte@sugflora.com".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    pub subject: String,
    pub text: String,
    pub html: String,
}

pub fn compose(payload: &NotificationPayload, branding: &Branding) -> ComposedMessage {
    ComposedMessage {
        subject: subject(payload),
        text: render_text(payload, branding),
        html: render_html(payload, branding),
    }
}

/// Fixed message used to check that a backend is wired up correctly.
pub fn test_message(branding: &Branding) -> ComposedMessage {
    let app = html_escape(&branding.app_name);
    ComposedMessage {
        subject: format!("Teste de Configuração - {}", branding.app_name),
        text: format!(
            "Este é um email de teste do {app}.\n\nSe você recebeu este email, a configuração está funcionando corretamente!",
            app = branding.app_name
        ),
        html: format!(
            "<h2>🌿 {app}</h2>\n<p>Este é um email de teste do {app}.</p>\n<p>Se você recebeu este email, a configuração está funcionando corretamente!</p>",
            app = app
        ),
    }
}

pub fn subject(payload: &NotificationPayload) -> String {
    format!(
        "Nova sugestão de identificação para sua coleta \"{}\"",
        payload.collection_name
    )
}

/// `(label, value)` pairs for the taxonomic fields that are present, in
/// family, genus, species, common-name order.
fn classification(payload: &NotificationPayload) -> Vec<(&'static str, &str)> {
    [
        ("Família", payload.suggested_family.as_deref()),
        ("Gênero", payload.suggested_genus.as_deref()),
        ("Espécie", payload.suggested_species.as_deref()),
        ("Nome comum", payload.suggested_common_name.as_deref()),
    ]
    .into_iter()
    .filter_map(|(label, value)| {
        value
            .filter(|v| !v.trim().is_empty())
            .map(|v| (label, v))
    })
    .collect()
}

fn notes(payload: &NotificationPayload) -> Option<&str> {
    payload
        .additional_notes
        .as_deref()
        .filter(|n| !n.trim().is_empty())
}

/// Collection date as `dd/mm/yyyy`. Unrecognised input is echoed back.
pub fn format_collection_date(raw: &str) -> String {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.date_naive().format("%d/%m/%Y").to_string();
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return dt.date().format("%d/%m/%Y").to_string();
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return d.format("%d/%m/%Y").to_string();
    }
    raw.to_string()
}

fn render_text(payload: &NotificationPayload, branding: &Branding) -> String {
    let details = classification(payload)
        .into_iter()
        .map(|(label, value)| format!("{}: {}", label, value))
        .collect::<Vec<_>>()
        .join("\n");

    let mut out = String::new();
    out.push_str("Olá!\n\n");
    out.push_str(&format!(
        "Você recebeu uma nova sugestão de identificação para sua coleta \"{}\".\n\n",
        payload.collection_name
    ));
    out.push_str("DETALHES DA SUGESTÃO:\n");
    if !details.is_empty() {
        out.push_str(&details);
        out.push('\n');
    }
    out.push_str(&format!("\nJUSTIFICATIVA:\n{}\n\n", payload.justification));
    out.push_str(&format!(
        "NÍVEL DE CONFIANÇA: {}\n\n",
        payload.confidence_level().label()
    ));
    if let Some(notes) = notes(payload) {
        out.push_str(&format!("OBSERVAÇÕES ADICIONAIS:\n{}\n\n", notes));
    }
    out.push_str(&format!(
        "SUGESTOR: {} ({})\n\n",
        payload.suggester_name, payload.suggester_address
    ));
    out.push_str(&format!(
        "DATA DA COLETA: {}\n\n",
        format_collection_date(&payload.collection_date)
    ));
    out.push_str(&format!(
        "Para visualizar e responder a esta sugestão, acesse o aplicativo {}.\n\n",
        branding.app_name
    ));
    out.push_str(&format!("Atenciosamente,\nEquipe {}", branding.app_name));
    out
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_html(payload: &NotificationPayload, branding: &Branding) -> String {
    let level = payload.confidence_level();
    let app = html_escape(&branding.app_name);
    let details = classification(payload)
        .into_iter()
        .map(|(label, value)| format!("<strong>{}:</strong> {}", label, html_escape(value)))
        .collect::<Vec<_>>()
        .join("<br>");
    let notes_section = match notes(payload) {
        Some(n) => format!(
            "\n                <h4>📝 Observações Adicionais:</h4>\n                <p>{}</p>",
            html_escape(n)
        ),
        None => String::new(),
    };
    let support = if branding.support_email.trim().is_empty() {
        String::new()
    } else {
        format!(
            "\n            <p>Para suporte: {}</p>",
            html_escape(&branding.support_email)
        )
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <style>
        body {{ font-family: Arial, sans-serif; line-height: 1.6; color: #333; }}
        .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
        .header {{ background-color: #2e7d32; color: white; padding: 20px; text-align: center; border-radius: 8px 8px 0 0; }}
        .content {{ background-color: #f9f9f9; padding: 20px; border-radius: 0 0 8px 8px; }}
        .suggestion {{ background-color: white; padding: 15px; margin: 15px 0; border-left: 4px solid #2e7d32; border-radius: 4px; }}
        .classification {{ margin: 10px 0; }}
        .confidence {{ display: inline-block; padding: 5px 10px; border-radius: 15px; color: white; font-weight: bold; }}
        .footer {{ margin-top: 20px; padding-top: 20px; border-top: 1px solid #ddd; font-size: 12px; color: #666; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="header">
            <h1>🌿 {app}</h1>
            <h2>Nova Sugestão de Identificação</h2>
        </div>
        <div class="content">
            <p>Olá!</p>
            <p>Você recebeu uma nova sugestão de identificação para sua coleta <strong>"{collection}"</strong>.</p>
            <div class="suggestion">
                <h3>📋 Detalhes da Sugestão</h3>
                <div class="classification">
                    {details}
                </div>
                <h4>💡 Justificativa:</h4>
                <p>{justification}</p>
                <h4>🎯 Nível de Confiança:</h4>
                <span class="confidence" style="background-color: {color}">{label}</span>{notes_section}
            </div>
            <p><strong>Sugestor:</strong> {suggester} ({suggester_address})</p>
            <p><strong>Data da Coleta:</strong> {date}</p>
            <p>Para visualizar e responder a esta sugestão, acesse o aplicativo {app}.</p>
        </div>
        <div class="footer">
            <p>Atenciosamente,<br>Equipe {app}</p>{support}
        </div>
    </div>
</body>
</html>"#,
        app = app,
        collection = html_escape(&payload.collection_name),
        details = details,
        justification = html_escape(&payload.justification),
        color = level.color(),
        label = level.label(),
        notes_section = notes_section,
        suggester = html_escape(&payload.suggester_name),
        suggester_address = html_escape(&payload.suggester_address),
        date = html_escape(&format_collection_date(&payload.collection_date)),
        support = support,
    )
}
