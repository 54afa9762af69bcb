use serde::Serialize;

use super::{client::EmailClient, words};
use crate::rng::SimulationRng;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub company: Option<String>,
    pub client: EmailClient,
}

impl User {
    /// Name, optional company and address, one per line.
    pub fn signature(&self) -> String {
        let mut parts = vec![self.display_name()];
        if let Some(company) = &self.company {
            parts.push(company.clone());
        }
        parts.push(self.email.clone());
        parts.join("\n")
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// `Name <address>` form used in message headers.
    pub fn mailbox(&self) -> String {
        format!("{} <{}>", self.display_name(), self.email)
    }
}

/// Which part of a user `modify_random_user` rewrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserField {
    Email,
    Name,
    Company,
    All,
}

impl UserField {
    const ALL: [Self; 4] = [Self::Email, Self::Name, Self::Company, Self::All];

    pub(super) fn pick(rng: &SimulationRng) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }

    pub(super) fn apply(self, user: &mut User, rng: &SimulationRng, taken: &[String]) {
        if matches!(self, Self::Email | Self::All) {
            user.email = unique_email(rng, &user.first_name, &user.last_name, taken);
        }
        if matches!(self, Self::Name | Self::All) {
            user.first_name = pick(rng, words::FIRST_NAMES).to_owned();
            user.last_name = pick(rng, words::LAST_NAMES).to_owned();
        }
        if matches!(self, Self::Company | Self::All) {
            user.company = company(rng);
        }
    }
}

pub(super) fn generate(rng: &SimulationRng, taken: &[String]) -> User {
    let first_name = pick(rng, words::FIRST_NAMES).to_owned();
    let last_name = pick(rng, words::LAST_NAMES).to_owned();
    let email = unique_email(rng, &first_name, &last_name, taken);
    User {
        first_name,
        last_name,
        email,
        company: company(rng),
        client: EmailClient::pick(rng),
    }
}

fn company(rng: &SimulationRng) -> Option<String> {
    rng.gen_bool(0.5).then(|| {
        format!(
            "{} {}",
            pick(rng, words::COMPANY_WORDS),
            pick(rng, words::COMPANY_SUFFIXES)
        )
    })
}

fn unique_email(rng: &SimulationRng, first: &str, last: &str, taken: &[String]) -> String {
    loop {
        let domain = pick(rng, words::DOMAINS);
        let local = match rng.gen_range(0..3u8) {
            0 => format!("{}.{}", first, last),
            1 => format!("{}{}", &first[..1], last),
            _ => format!("{}{}", first, rng.gen_range(1..1000u32)),
        };
        let email = format!("{}@{domain}", local.to_lowercase());
        if !taken.contains(&email) {
            return email;
        }
    }
}

pub(super) fn pick<'a>(rng: &SimulationRng, items: &'a [&'a str]) -> &'a str {
    items[rng.gen_range(0..items.len())]
}
