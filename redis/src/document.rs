//! Hash layout of a cached product and RediSearch reply parsing.

use chrono::{DateTime, Utc};
use redis::Value;
use std::collections::HashMap;
use stockroom_core::error::StorageError;
use stockroom_core::model::{Product, ProductId};
use uuid::Uuid;

/// Key prefix covered by the search index.
pub const KEY_PREFIX: &str = "product:";

/// Hash key of one product.
#[must_use]
pub fn product_key(id: ProductId) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Field/value pairs written with `HSET`.
#[must_use]
pub fn to_fields(product: &Product) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", product.id.to_string()),
        ("name", product.name.clone()),
        ("slug", product.slug.clone()),
        ("description", product.description.clone()),
        ("price", product.price.to_string()),
        ("quantity", product.quantity.to_string()),
        ("image", product.image.clone()),
        ("version", product.version.to_string()),
        ("created_at", product.created_at.to_rfc3339()),
    ];
    if let Some(updated_at) = product.updated_at {
        fields.push(("updated_at", updated_at.to_rfc3339()));
    }
    fields
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StorageError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StorageError::Serialization(format!("cached product missing {name}")))
}

fn parse<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T, StorageError> {
    field(fields, name)?
        .parse()
        .map_err(|_| StorageError::Serialization(format!("cached product has malformed {name}")))
}

fn timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp {value}: {e}")))
}

/// Rebuild a product from its hash fields.
///
/// # Errors
///
/// Returns [`StorageError::Serialization`] if a required field is missing or malformed.
pub fn from_fields(fields: &HashMap<String, String>) -> Result<Product, StorageError> {
    let id: Uuid = parse(fields, "id")?;
    Ok(Product {
        id: ProductId::from_uuid(id),
        name: field(fields, "name")?.to_string(),
        slug: field(fields, "slug")?.to_string(),
        description: fields.get("description").cloned().unwrap_or_default(),
        price: parse(fields, "price")?,
        quantity: parse(fields, "quantity")?,
        image: fields.get("image").cloned().unwrap_or_default(),
        created_at: timestamp(field(fields, "created_at")?)?,
        updated_at: fields.get("updated_at").map(|v| timestamp(v)).transpose()?,
        version: parse(fields, "version")?,
        deleted: false,
    })
}

fn text(value: &Value) -> Result<String, StorageError> {
    redis::from_redis_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Parse an `FT.SEARCH` reply: `[total, key, [field, value, ...], key, [...], ...]`.
///
/// # Errors
///
/// Returns [`StorageError::Serialization`] on an unexpected reply shape.
pub fn parse_search_reply(reply: &Value) -> Result<Vec<HashMap<String, String>>, StorageError> {
    let Value::Array(items) = reply else {
        return Err(StorageError::Serialization(format!("unexpected search reply: {reply:?}")));
    };

    // Skip the total and the first key, then take every field list.
    items
        .iter()
        .skip(2)
        .step_by(2)
        .map(|doc| {
            let Value::Array(pairs) = doc else {
                return Err(StorageError::Serialization(format!("unexpected document: {doc:?}")));
            };
            pairs
                .chunks(2)
                .filter(|pair| pair.len() == 2)
                .map(|pair| Ok((text(&pair[0])?, text(&pair[1])?)))
                .collect()
        })
        .collect()
}

/// Escape RediSearch query syntax in user input.
#[must_use]
pub fn escape_query(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_punctuation() || c.is_whitespace() {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `FT.SEARCH` query for a name fragment, or everything.
#[must_use]
pub fn name_query(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("@name:*{}*", escape_query(name)),
        None => "*".to_string(),
    }
}
