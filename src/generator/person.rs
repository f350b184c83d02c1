//! The built-in `person` template.
//!
//! Document size is controlled with an explicit cost model: every field has a
//! known serialized cost (field name, value, JSON punctuation), and the
//! remaining budget is filled with a `padding` string.

use std::collections::BTreeMap;

use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Document, SeededRng, Template};
use crate::error::GeneratorError;

const TEMPLATE_NAME: &str = "person";

/// Fields that update operations may rewrite.
pub const MUTABLE_FIELDS: [&str; 6] = ["first_name", "last_name", "age", "email", "address", "hobbies"];

/// Number of sub-document paths generated per call.
pub const SUB_DOC_PATHS: usize = 3;

const FIRST_NAMES: [&str; 12] = [
    "Ada", "Grace", "Alan", "Edsger", "Barbara", "Donald", "Frances", "Ken", "Radia", "Niklaus",
    "Margaret", "Tony",
];
const LAST_NAMES: [&str; 12] = [
    "Lovelace", "Hopper", "Turing", "Dijkstra", "Liskov", "Knuth", "Allen", "Thompson", "Perlman",
    "Wirth", "Hamilton", "Hoare",
];
const STREETS: [&str; 8] = [
    "Main St", "High St", "Station Rd", "Church Ln", "Mill Rd", "Park Ave", "Elm St", "Bridge St",
];
const CITIES: [&str; 8] = [
    "Lisbon", "Oslo", "Kyoto", "Austin", "Nairobi", "Lyon", "Porto", "Quebec",
];
const COUNTRIES: [&str; 8] = [
    "Portugal", "Norway", "Japan", "USA", "Kenya", "France", "Brazil", "Canada",
];
const HOBBIES: [&str; 10] = [
    "chess", "climbing", "cycling", "go", "pottery", "rowing", "sailing", "sketching", "tennis",
    "woodwork",
];
const DOMAINS: [&str; 4] = ["example.com", "example.org", "mail.test", "corp.invalid"];
const PADDING_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

// Per-field JSON overhead: two quotes around the name, colon, comma.
const FIELD_OVERHEAD: usize = 4;
// Quotes around a string value.
const STRING_OVERHEAD: usize = 2;
// Upper bound for a u32 rendered as JSON.
const NUMBER_COST: usize = 10;

/// Postal address of a [`Person`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub country: String,
    pub zip: String,
}

impl Address {
    fn generate(rng: &mut SeededRng) -> Self {
        Self {
            street: format!("{} {}", rng.random_range(1..2000u32), pick(rng, &STREETS)),
            city: pick(rng, &CITIES).to_string(),
            country: pick(rng, &COUNTRIES).to_string(),
            zip: format!("{:05}", rng.random_range(0..100_000u32)),
        }
    }

    fn cost(&self) -> usize {
        2 + string_field("street", &self.street)
            + string_field("city", &self.city)
            + string_field("country", &self.country)
            + string_field("zip", &self.zip)
    }
}

/// Document shape produced by [`PersonTemplate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub age: u32,
    pub email: String,
    pub address: Address,
    pub hobbies: Vec<String>,
    /// Number of updates applied since generation.
    pub mutated: u32,
    pub padding: String,
}

impl Person {
    /// Serialized cost of every field except the padding value.
    pub fn fixed_cost(&self) -> usize {
        let hobbies = 2 + self
            .hobbies
            .iter()
            .map(|h| h.len() + STRING_OVERHEAD + 1)
            .sum::<usize>();
        2 + string_field("id", &self.id)
            + string_field("first_name", &self.first_name)
            + string_field("last_name", &self.last_name)
            + "age".len()
            + FIELD_OVERHEAD
            + NUMBER_COST
            + string_field("email", &self.email)
            + "address".len()
            + FIELD_OVERHEAD
            + self.address.cost()
            + "hobbies".len()
            + FIELD_OVERHEAD
            + hobbies
            + "mutated".len()
            + FIELD_OVERHEAD
            + NUMBER_COST
            + string_field("padding", "")
    }

    fn repad(&mut self, size: usize, rng: &mut SeededRng) {
        let budget = size.saturating_sub(self.fixed_cost());
        self.padding = padding(rng, budget);
    }

    fn mutate_field(&mut self, field: &str, rng: &mut SeededRng) -> Result<(), GeneratorError> {
        match field {
            "first_name" => self.first_name = pick(rng, &FIRST_NAMES).to_string(),
            "last_name" => self.last_name = pick(rng, &LAST_NAMES).to_string(),
            "age" => self.age = rng.random_range(18..90),
            "email" => self.email = email(rng, &self.first_name, &self.last_name),
            "address" => self.address = Address::generate(rng),
            "hobbies" => self.hobbies = hobbies(rng),
            other => {
                return Err(GeneratorError::UnknownField {
                    template: TEMPLATE_NAME.to_string(),
                    field: other.to_string(),
                })
            }
        }
        Ok(())
    }
}

/// Template producing [`Person`] documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersonTemplate;

impl Template for PersonTemplate {
    fn name(&self) -> &str {
        TEMPLATE_NAME
    }

    fn generate_document(&self, rng: &mut SeededRng, key: &str, size: usize) -> Document {
        let first_name = pick(rng, &FIRST_NAMES).to_string();
        let last_name = pick(rng, &LAST_NAMES).to_string();
        let mut person = Person {
            id: key.to_string(),
            email: email(rng, &first_name, &last_name),
            first_name,
            last_name,
            age: rng.random_range(18..90),
            address: Address::generate(rng),
            hobbies: hobbies(rng),
            mutated: 0,
            padding: String::new(),
        };
        person.repad(size, rng);
        to_document(&person)
    }

    fn update_document(
        &self,
        fields: &[String],
        previous: &Document,
        size: usize,
        rng: &mut SeededRng,
    ) -> Result<Document, GeneratorError> {
        let mut person = from_document(previous)?;
        if fields.is_empty() {
            for field in MUTABLE_FIELDS {
                person.mutate_field(field, rng)?;
            }
        } else {
            for field in fields {
                person.mutate_field(field, rng)?;
            }
        }
        person.mutated += 1;
        person.repad(size, rng);

        // Preserve fields outside the template shape (sub-document writes).
        let mut updated = to_document(&person);
        if let (Some(prev), Some(next)) = (previous.as_object(), updated.as_object_mut()) {
            for (name, value) in prev {
                if !next.contains_key(name) {
                    next.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(updated)
    }

    fn generate_sub_path_and_value(
        &self,
        rng: &mut SeededRng,
        size: usize,
    ) -> BTreeMap<String, Value> {
        (0..SUB_DOC_PATHS)
            .map(|i| {
                let path = format!("sub_doc.{}_{i}", pick(rng, &HOBBIES));
                (path, Value::String(padding(rng, size)))
            })
            .collect()
    }

    fn compare(&self, expected: &Document, actual: &Document) -> Result<bool, GeneratorError> {
        for doc in [expected, actual] {
            if !doc.is_object() {
                return Err(GeneratorError::Malformed {
                    template: TEMPLATE_NAME.to_string(),
                    message: "document is not a JSON object".to_string(),
                });
            }
        }
        Ok(expected == actual)
    }
}

fn pick<'a>(rng: &mut SeededRng, values: &[&'a str]) -> &'a str {
    values[rng.random_range(0..values.len())]
}

fn email(rng: &mut SeededRng, first: &str, last: &str) -> String {
    format!(
        "{}.{}{}@{}",
        first.to_ascii_lowercase(),
        last.to_ascii_lowercase(),
        rng.random_range(0..1000u32),
        pick(rng, &DOMAINS)
    )
}

fn hobbies(rng: &mut SeededRng) -> Vec<String> {
    let count = rng.random_range(1..=3usize);
    (0..count).map(|_| pick(rng, &HOBBIES).to_string()).collect()
}

fn padding(rng: &mut SeededRng, len: usize) -> String {
    (0..len)
        .map(|_| PADDING_CHARSET[rng.random_range(0..PADDING_CHARSET.len())] as char)
        .collect()
}

fn string_field(name: &str, value: &str) -> usize {
    name.len() + FIELD_OVERHEAD + value.len() + STRING_OVERHEAD
}

fn to_document(person: &Person) -> Document {
    serde_json::to_value(person).unwrap_or(Value::Null)
}

fn from_document(doc: &Document) -> Result<Person, GeneratorError> {
    Person::deserialize(doc).map_err(|e| GeneratorError::Malformed {
        template: TEMPLATE_NAME.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::seeded_rng;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_generation_is_deterministic() {
        let template = PersonTemplate;
        let a = template.generate_document(&mut seeded_rng(42), "key-42", 512);
        let b = template.generate_document(&mut seeded_rng(42), "key-42", 512);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn test_different_seeds_differ() {
        let template = PersonTemplate;
        let a = template.generate_document(&mut seeded_rng(1), "k", 512);
        let b = template.generate_document(&mut seeded_rng(2), "k", 512);
        assert_ne!(a, b);
    }

    #[test]
    fn test_size_model_tracks_target_size() {
        let template = PersonTemplate;
        for size in [512usize, 1024, 4096] {
            let doc = template.generate_document(&mut seeded_rng(7), "key", size);
            let actual = serde_json::to_vec(&doc).unwrap().len();
            assert!(
                actual <= size + 16 && actual + 64 >= size,
                "target {size}, serialized {actual}"
            );
        }
    }

    #[test]
    fn test_small_size_yields_empty_padding() {
        let doc = PersonTemplate.generate_document(&mut seeded_rng(3), "key", 1);
        assert_eq!(doc["padding"], "");
    }

    #[test]
    fn test_update_changes_only_listed_fields() {
        let template = PersonTemplate;
        let original = template.generate_document(&mut seeded_rng(9), "key", 256);
        let updated = template
            .update_document(&["age".to_string()], &original, 256, &mut seeded_rng(99))
            .unwrap();
        assert_eq!(updated["first_name"], original["first_name"]);
        assert_eq!(updated["address"], original["address"]);
        assert_eq!(updated["mutated"], 1);
    }

    #[test]
    fn test_update_preserves_sub_document_fields() {
        let template = PersonTemplate;
        let mut original = template.generate_document(&mut seeded_rng(9), "key", 256);
        original["sub_doc"] = serde_json::json!({"chess_0": "x"});
        let updated = template
            .update_document(&[], &original, 256, &mut seeded_rng(5))
            .unwrap();
        assert_eq!(updated["sub_doc"]["chess_0"], "x");
    }

    #[test]
    fn test_update_unknown_field_fails() {
        let template = PersonTemplate;
        let original = template.generate_document(&mut seeded_rng(9), "key", 256);
        let err = template
            .update_document(&["salary".to_string()], &original, 256, &mut seeded_rng(1))
            .unwrap_err();
        assert!(matches!(err, GeneratorError::UnknownField { .. }));
    }

    #[test]
    fn test_sub_paths_are_deterministic_and_sized() {
        let template = PersonTemplate;
        let a = template.generate_sub_path_and_value(&mut seeded_rng(11), 32);
        let b = template.generate_sub_path_and_value(&mut seeded_rng(11), 32);
        assert_eq!(a, b);
        assert_eq!(a.len(), SUB_DOC_PATHS);
        for value in a.values() {
            assert_eq!(value.as_str().unwrap().len(), 32);
        }
    }

    #[test]
    fn test_compare_rejects_non_objects() {
        let template = PersonTemplate;
        assert!(template
            .compare(&Value::Null, &serde_json::json!({}))
            .is_err());
        assert!(template
            .compare(&serde_json::json!({"a": 1}), &serde_json::json!({"a": 1}))
            .unwrap());
    }
}
