//! Connection admission hook.
//!
//! The broker itself carries no authentication policy. Front ends ask an
//! [`Admission`] implementation before any registry mutation happens.

/// Decides whether a new connection may register.
pub trait Admission: Send + Sync {
    /// `credential` is whatever the front end extracted for the client (a
    /// token, a cookie), if anything.
    fn admit_client(&self, credential: Option<&str>) -> bool;

    fn admit_worker(&self, access_key: Option<&str>) -> bool;
}

/// Admits every client; admits workers presenting the shared access key.
#[derive(Debug, Clone)]
pub struct AccessKeyAdmission {
    worker_key: String,
}

impl AccessKeyAdmission {
    pub fn new(worker_key: impl Into<String>) -> Self {
        Self {
            worker_key: worker_key.into(),
        }
    }
}

impl Admission for AccessKeyAdmission {
    fn admit_client(&self, _credential: Option<&str>) -> bool {
        true
    }

    fn admit_worker(&self, access_key: Option<&str>) -> bool {
        match access_key {
            Some(key) => !self.worker_key.is_empty() && constant_time_eq(key, &self.worker_key),
            None => false,
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
