use serde::Serialize;

use super::user::User;
use crate::rng::SimulationRng;

/// Mail client a user writes with; decides how the body is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailClient {
    Default,
    Gmail,
    Outlook,
}

impl EmailClient {
    const ALL: [Self; 3] = [Self::Default, Self::Gmail, Self::Outlook];

    pub(super) fn pick(rng: &SimulationRng) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }

    /// Renders `text` signed by `sender`; returns the plain and HTML bodies.
    pub fn render(self, sender: &User, text: &str) -> (String, String) {
        let signature = sender.signature();
        let plain = match self {
            Self::Default | Self::Gmail => format!("{text}\n\n--\n{signature}"),
            Self::Outlook => format!("{text}\n\n{signature}"),
        };
        let body = escape_html(text).replace('\n', "<br/>\n");
        let signature = escape_html(&signature).replace('\n', "<br/>\n");
        let html = match self {
            Self::Default => format!(
                "<html>\n<body>\n<div style=\"font-family: Arial, sans-serif;\">\n\
                 <p>{body}</p>\n<br/>\n<div style=\"color: #666;\">\n{signature}\n</div>\n\
                 </div>\n</body>\n</html>"
            ),
            Self::Gmail => format!(
                "<html>\n<body>\n<div style=\"font-family: Arial, sans-serif; color: #202124; \
                 font-size: 14px; line-height: 1.5;\">\n<p>{body}</p>\n<br/>\n\
                 <div style=\"color: #666; font-size: 13px; padding-top: 12px; \
                 border-top: 1px solid #e0e0e0; margin-top: 12px;\">\n{signature}\n</div>\n\
                 </div>\n</body>\n</html>"
            ),
            Self::Outlook => format!(
                "<html>\n<body style=\"font-family: 'Segoe UI', Tahoma, Geneva, Verdana, \
                 sans-serif; font-size: 11pt; color: #000000;\">\n<div>\n<p>{body}</p>\n\
                 <div style=\"border-top: solid 1.0pt #E1E1E1; padding-top: 8px; \
                 margin-top: 15px;\">\n{signature}\n</div>\n</div>\n</body>\n</html>"
            ),
        };
        (plain, html)
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    escaped
}
