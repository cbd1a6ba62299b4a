//! Records for logging training status.
//!
//! A [`Record`] is the "status dict" of one training step: scalar
//! metrics such as the policy loss, the mean reward, the KL estimate and
//! response lengths, keyed by name.
use crate::error::TwirlError;
use chrono::prelude::{DateTime, Local};
use std::{
    collections::{
        hash_map::{Iter, Keys},
        HashMap,
    },
    convert::Into,
};

/// Represents possible types of values in a [`Record`].
#[derive(Debug, Clone)]
pub enum RecordValue {
    /// Scalar, e.g., metrics.
    Scalar(f32),

    /// Date and time.
    DateTime(DateTime<Local>),

    /// A string, e.g., a checkpoint tag.
    String(String),
}

/// Represents a record for logging.
#[derive(Debug, Default)]
pub struct Record(HashMap<String, RecordValue>);

impl Record {
    /// Constructs an empty record.
    pub fn empty() -> Self {
        Self(HashMap::new())
    }

    /// Constructs a record from a scalar.
    pub fn from_scalar(name: impl Into<String>, value: f32) -> Self {
        Self(HashMap::from([(name.into(), RecordValue::Scalar(value))]))
    }

    /// Constructs a record from a slice of key-value pairs.
    pub fn from_slice<K: Into<String> + Clone>(s: &[(K, RecordValue)]) -> Self {
        Self(
            s.iter()
                .map(|(k, v)| (k.clone().into(), v.clone()))
                .collect(),
        )
    }

    /// Returns keys of the record.
    pub fn keys(&self) -> Keys<String, RecordValue> {
        self.0.keys()
    }

    /// Inserts a key-value pair into the record.
    pub fn insert(&mut self, k: impl Into<String>, v: RecordValue) {
        self.0.insert(k.into(), v);
    }

    /// Returns an iterator over key-value pairs in the record.
    pub fn iter(&self) -> Iter<'_, String, RecordValue> {
        self.0.iter()
    }

    /// Gets the value of the given key.
    pub fn get(&self, k: &str) -> Option<&RecordValue> {
        self.0.get(k)
    }

    /// Returns `true` if the record contains the given key.
    pub fn contains_key(&self, k: &str) -> bool {
        self.0.contains_key(k)
    }

    /// Merges records.
    pub fn merge(self, record: Record) -> Self {
        Record(self.0.into_iter().chain(record.0).collect())
    }

    /// Gets scalar value.
    pub fn get_scalar(&self, k: &str) -> Result<f32, TwirlError> {
        if let Some(v) = self.0.get(k) {
            match v {
                RecordValue::Scalar(v) => Ok(*v),
                _ => Err(TwirlError::RecordValueType("Scalar".to_string())),
            }
        } else {
            Err(TwirlError::RecordKey(k.to_string()))
        }
    }

    /// Gets string value.
    pub fn get_string(&self, k: &str) -> Result<String, TwirlError> {
        if let Some(v) = self.0.get(k) {
            match v {
                RecordValue::String(s) => Ok(s.clone()),
                _ => Err(TwirlError::RecordValueType("String".to_string())),
            }
        } else {
            Err(TwirlError::RecordKey(k.to_string()))
        }
    }

    /// Returns `true` if the record is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Averages scalar values over records, key by key.
    ///
    /// Non-scalar values are taken from the first record containing the
    /// key. Keys missing from some records are averaged over the records
    /// that do contain them.
    pub fn mean_scalars<'a>(records: impl IntoIterator<Item = &'a Record>) -> Record {
        let mut sums: HashMap<String, (f32, usize)> = HashMap::new();
        let mut others: HashMap<String, RecordValue> = HashMap::new();

        for record in records {
            for (k, v) in record.iter() {
                match v {
                    RecordValue::Scalar(x) => {
                        let e = sums.entry(k.clone()).or_insert((0.0, 0));
                        e.0 += x;
                        e.1 += 1;
                    }
                    v => {
                        others.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
        }

        let mut out = Record::empty();
        for (k, (sum, n)) in sums {
            out.insert(k, RecordValue::Scalar(sum / n as f32));
        }
        for (k, v) in others {
            out.insert(k, v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_scalars() {
        let r1 = Record::from_slice(&[
            ("loss", RecordValue::Scalar(1.0)),
            ("kl", RecordValue::Scalar(0.5)),
        ]);
        let r2 = Record::from_slice(&[
            ("loss", RecordValue::Scalar(3.0)),
            ("kl", RecordValue::Scalar(1.5)),
        ]);
        let mean = Record::mean_scalars([&r1, &r2]);
        assert_eq!(mean.get_scalar("loss").unwrap(), 2.0);
        assert_eq!(mean.get_scalar("kl").unwrap(), 1.0);
    }

    #[test]
    fn test_get_scalar_errors() {
        let r = Record::from_scalar("loss", 1.0);
        assert!(r.get_scalar("loss").is_ok());
        assert!(r.get_scalar("missing").is_err());
        assert!(r.get_string("loss").is_err());
    }
}
