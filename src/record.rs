use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_ID_PREFIX: &str = "customer123_yzrb!ID";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

// One synthetic document. Field names are the ones the target collection indexes,
// so the struct serializes straight into the update request body.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Record {
    pub id: String,
    pub email: String,
    pub last_name: String,
    pub first_name: String,
    pub created_at: String,
}

/// Formats an instant as `yyyy-MM-ddTHH:mm:ssZ`, truncated to the second.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

// Builds the records of a single run. The surname is drawn once when the factory is
// created and stamped on every record, which gives the cluster a repeated-key workload.
pub struct RecordFactory {
    rng: StdRng,
    id_prefix: String,
    last_name: String,
}

impl RecordFactory {
    pub fn new(id_prefix: impl Into<String>, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let last_name = random_token(&mut rng);
        Self {
            rng,
            id_prefix: id_prefix.into(),
            last_name,
        }
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn next(&mut self, now: DateTime<Utc>) -> Record {
        let token = random_token(&mut self.rng);
        Record {
            id: format!("{}{}", self.id_prefix, token),
            email: format!("email{token}"),
            last_name: self.last_name.clone(),
            first_name: format!("fname{token}"),
            created_at: format_timestamp(now),
        }
    }
}

// A version 4 UUID drawn from the factory's generator instead of the OS, so seeded
// runs are reproducible.
fn random_token(rng: &mut StdRng) -> String {
    let bytes: [u8; 16] = rng.gen();
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .hyphenated()
        .to_string()
}

impl Record {
    #[cfg(test)]
    pub(crate) fn token(&self) -> Option<&str> {
        self.email.strip_prefix("email")
    }
}
