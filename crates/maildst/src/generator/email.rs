//! Building outgoing messages and reading delivered ones back.

use super::{user::User, DataGenerator, GeneratorError};
use crate::{clock::Timestamp, controller::OutgoingMessage, rng::SimulationRng};

/// Date header format; the simulated clock has no zone, it is reported as UTC.
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S +0000";

const BODY_PARAGRAPHS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedEmail {
    pub sender: User,
    pub recipient: User,
    pub subject: String,
    pub text_content: String,
    pub html_content: String,
    pub date: Timestamp,
    boundary: String,
    message_id: String,
}

impl GeneratedEmail {
    /// A message from a pooled user to a freshly generated one, dated `date`.
    pub fn new(
        generator: &DataGenerator,
        rng: &SimulationRng,
        date: Timestamp,
    ) -> Result<Self, GeneratorError> {
        let sender = generator.random_user(rng)?;
        let recipient = generator.generate_user(rng);
        let subject = generator.generate_subject(rng);
        let text = generator.generate_text_content(rng, BODY_PARAGRAPHS);
        let (text_content, html_content) = sender.client.render(&sender, &text);
        let boundary = format!("=_{:016x}", rng.gen_u64());
        let message_id = format!("<{:016x}@{}>", rng.gen_u64(), domain_of(&sender.email));
        Ok(Self {
            sender,
            recipient,
            subject,
            text_content,
            html_content,
            date,
            boundary,
            message_id,
        })
    }

    pub fn date_header(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    /// Renders the message as `multipart/alternative` with a plain and an
    /// HTML part, both 7bit.
    pub fn to_message(&self) -> OutgoingMessage {
        let boundary = &self.boundary;
        let raw = format!(
            "From: {from}\n\
             To: {to}\n\
             Subject: {subject}\n\
             Date: {date}\n\
             Message-ID: {id}\n\
             MIME-Version: 1.0\n\
             Content-Type: multipart/alternative; boundary=\"{boundary}\"\n\
             \n\
             --{boundary}\n\
             Content-Type: text/plain; charset=\"us-ascii\"\n\
             Content-Transfer-Encoding: 7bit\n\
             \n\
             {text}\n\
             --{boundary}\n\
             Content-Type: text/html; charset=\"us-ascii\"\n\
             Content-Transfer-Encoding: 7bit\n\
             \n\
             {html}\n\
             --{boundary}--\n",
            from = self.sender.mailbox(),
            to = self.recipient.mailbox(),
            subject = self.subject,
            date = self.date_header(),
            id = self.message_id,
            text = self.text_content,
            html = self.html_content,
        );
        OutgoingMessage {
            recipient: self.recipient.email.clone(),
            subject: self.subject.clone(),
            raw,
        }
    }
}

fn domain_of(email: &str) -> &str {
    email.rsplit_once('@').map_or("localhost", |(_, d)| d)
}

/// The parts of a delivered message a validator compares.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub headers: Vec<(String, String)>,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    /// Lowercase MIME type without parameters, e.g. `text/plain`.
    pub content_type: String,
    pub body: String,
}

impl ParsedMessage {
    /// Parses a message as written by the receiving MTA. Line endings are
    /// normalized, folded headers unfolded and a single multipart level split
    /// into its parts.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.replace("\r\n", "\n");
        let (head, body) = split_head(&raw);
        let headers = parse_headers(head);
        let content_type = find_header(&headers, "content-type").unwrap_or("text/plain");
        let parts = match boundary_param(content_type) {
            Some(boundary) => split_parts(body, &boundary),
            None => vec![MessagePart {
                content_type: mime_type(content_type),
                body: trim_body(body),
            }],
        };
        Self { headers, parts }
    }

    /// First value of header `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn part(&self, content_type: &str) -> Option<&MessagePart> {
        self.parts.iter().find(|p| p.content_type == content_type)
    }
}

fn split_head(raw: &str) -> (&str, &str) {
    raw.split_once("\n\n").unwrap_or((raw, ""))
}

fn parse_headers(head: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }
    headers
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn mime_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn boundary_param(content_type: &str) -> Option<String> {
    if !mime_type(content_type).starts_with("multipart/") {
        return None;
    }
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_owned())
    })
}

fn split_parts(body: &str, boundary: &str) -> Vec<MessagePart> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in body.split('\n') {
        if line.starts_with(&delimiter) {
            if let Some(lines) = current.take() {
                parts.push(parse_part(&lines.join("\n")));
            }
            if line.trim_end() == format!("{delimiter}--") {
                break;
            }
            current = Some(Vec::new());
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    parts
}

fn parse_part(raw: &str) -> MessagePart {
    let (head, body) = split_head(raw);
    let headers = parse_headers(head);
    MessagePart {
        content_type: mime_type(find_header(&headers, "content-type").unwrap_or("text/plain")),
        body: trim_body(body),
    }
}

fn trim_body(body: &str) -> String {
    body.trim_end_matches('\n').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> (DataGenerator, GeneratedEmail) {
        let rng = SimulationRng::new(42);
        let generator = DataGenerator::new();
        generator.populate(&rng);
        let date = chrono::NaiveDate::from_ymd_opt(2025, 2, 14)
            .unwrap()
            .and_hms_opt(9, 30, 5)
            .unwrap();
        let email = GeneratedEmail::new(&generator, &rng, date).unwrap();
        (generator, email)
    }

    #[test]
    fn date_header_format() {
        let (_, email) = email();
        assert_eq!(email.date_header(), "Fri, 14 Feb 2025 09:30:05 +0000");
    }

    #[test]
    fn recipient_is_not_pooled() {
        let (generator, email) = email();
        assert!(generator.users().contains(&email.sender));
        assert!(!generator
            .users()
            .iter()
            .any(|u| u.email == email.recipient.email));
    }

    #[test]
    fn delivered_message_reads_back() {
        let (_, email) = email();
        let message = email.to_message();
        // exim prepends trace headers and may deliver with CRLF
        let delivered = format!(
            "Received: from local\r\n\tby receiver; {}\r\n{}",
            email.date_header(),
            message.raw.replace('\n', "\r\n")
        );
        let parsed = ParsedMessage::parse(&delivered);
        assert_eq!(parsed.header("subject"), Some(email.subject.as_str()));
        assert_eq!(parsed.header("Date"), Some(email.date_header().as_str()));
        assert_eq!(
            parsed.part("text/plain").map(|p| p.body.as_str()),
            Some(email.text_content.as_str())
        );
        assert_eq!(
            parsed.part("text/html").map(|p| p.body.as_str()),
            Some(email.html_content.as_str())
        );
    }

    #[test]
    fn single_part_message() {
        let parsed = ParsedMessage::parse("Subject: hi\nContent-Type: text/plain\n\nbody\n\n");
        assert_eq!(parsed.parts.len(), 1);
        assert_eq!(parsed.parts[0].body, "body");
    }
}
