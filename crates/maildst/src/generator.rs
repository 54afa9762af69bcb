//! Seeded synthetic data: a pool of users and message payloads.
//!
//! The pool is shared by every action of a run. All randomness comes from
//! the [`SimulationRng`] the caller passes in, normally the step's child
//! generator.

use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};

use crate::rng::SimulationRng;

mod client;
mod email;
mod user;
mod words;

pub use client::EmailClient;
pub use email::{GeneratedEmail, MessagePart, ParsedMessage, DATE_FORMAT};
pub use user::{User, UserField};

const INITIAL_USERS: std::ops::RangeInclusive<usize> = 1..=10;
const SUBJECT_PREFIXES: [(&str, f64); 3] = [("", 0.7), ("Re: ", 0.2), ("Fwd: ", 0.1)];

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("user pool is empty")]
    EmptyPool,
}

#[derive(Debug, Default)]
pub struct DataGenerator {
    users: Mutex<Vec<User>>,
}

impl DataGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the pool with between 1 and 10 users.
    pub fn populate(&self, rng: &SimulationRng) {
        let count = rng.gen_range(INITIAL_USERS);
        for _ in 0..count {
            self.add_random_user(rng);
        }
        tracing::debug!(users = count, "Populated user pool");
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    pub fn users(&self) -> Vec<User> {
        self.users.lock().clone()
    }

    /// A new user whose address is not in the pool. The pool is unchanged.
    pub fn generate_user(&self, rng: &SimulationRng) -> User {
        let users = self.users.lock();
        user::generate(rng, &emails(&users))
    }

    pub fn random_user(&self, rng: &SimulationRng) -> Result<User, GeneratorError> {
        let users = self.users.lock();
        if users.is_empty() {
            return Err(GeneratorError::EmptyPool);
        }
        Ok(users[rng.gen_range(0..users.len())].clone())
    }

    pub fn add_random_user(&self, rng: &SimulationRng) -> User {
        let mut users = self.users.lock();
        let user = user::generate(rng, &emails(&users));
        users.push(user.clone());
        tracing::debug!(email = %user.email, pool = users.len(), "Added user");
        user
    }

    /// Removes a random user. An emptied pool is refilled with one new user
    /// so that senders stay available.
    pub fn remove_random_user(&self, rng: &SimulationRng) -> Result<User, GeneratorError> {
        let mut users = self.users.lock();
        if users.is_empty() {
            return Err(GeneratorError::EmptyPool);
        }
        let index = rng.gen_range(0..users.len());
        let removed = users.remove(index);
        tracing::debug!(email = %removed.email, pool = users.len(), "Removed user");
        if users.is_empty() {
            tracing::debug!("No more users left, adding a new one");
            let user = user::generate(rng, &[]);
            users.push(user);
        }
        Ok(removed)
    }

    /// Rewrites the email, the name, the company or all of them for a
    /// random pooled user. Returns what changed and the updated user.
    pub fn modify_random_user(
        &self,
        rng: &SimulationRng,
    ) -> Result<(UserField, User), GeneratorError> {
        let mut users = self.users.lock();
        if users.is_empty() {
            return Err(GeneratorError::EmptyPool);
        }
        let index = rng.gen_range(0..users.len());
        let field = UserField::pick(rng);
        let taken = emails(&users);
        let user = &mut users[index];
        field.apply(user, rng, &taken);
        tracing::debug!(?field, email = %user.email, "Modified user");
        Ok((field, user.clone()))
    }

    /// A sentence of 3 to 8 words, prefixed with `Re: ` or `Fwd: ` 20% and
    /// 10% of the time.
    pub fn generate_subject(&self, rng: &SimulationRng) -> String {
        let prefix = match WeightedIndex::new(SUBJECT_PREFIXES.iter().map(|(_, w)| *w)) {
            Ok(index) => SUBJECT_PREFIXES[index.sample(&mut *rng.lock())].0,
            Err(_) => "",
        };
        let count = rng.gen_range(3..=8);
        format!("{prefix}{}", sentence(rng, count))
    }

    /// Sentences up to a length drawn from 150..=300 characters.
    pub fn generate_paragraph(&self, rng: &SimulationRng) -> String {
        let target = rng.gen_range(150..=300usize);
        let mut paragraph = String::new();
        loop {
            let count = rng.gen_range(4..=12);
            let next = format!("{}.", sentence(rng, count));
            if !paragraph.is_empty() && paragraph.len() + 1 + next.len() > target {
                break;
            }
            if !paragraph.is_empty() {
                paragraph.push(' ');
            }
            paragraph.push_str(&next);
        }
        paragraph
    }

    pub fn generate_text_content(&self, rng: &SimulationRng, paragraphs: usize) -> String {
        (0..paragraphs)
            .map(|_| self.generate_paragraph(rng))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn emails(users: &[User]) -> Vec<String> {
    users.iter().map(|u| u.email.clone()).collect()
}

fn sentence(rng: &SimulationRng, count: usize) -> String {
    let mut sentence = (0..count)
        .map(|_| user::pick(rng, words::WORDS))
        .collect::<Vec<_>>()
        .join(" ");
    if let Some(first) = sentence.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    sentence
}
