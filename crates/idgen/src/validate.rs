use crate::{
    Error, IdentifierSource, PoolConfig, RemoteConfig, Result, SequentialConfig, SourceKind,
    SourceLookup, ValidationErrors,
};
use std::collections::HashSet;

/// Checks a source definition before it is saved.
///
/// Field problems are collected and reported together as
/// [`Error::Validation`]. Pool definitions are also checked against `store`:
/// the refill source must exist, produce the same identifier type, and must
/// not lead back to the pool itself.
///
/// # Errors
///
/// Returns [`Error::Validation`] listing every rejected field, or the store's
/// error if it cannot be read.
pub fn validate_source(source: &IdentifierSource, store: &dyn SourceLookup) -> Result<()> {
    let mut errors = ValidationErrors::default();

    if source.name.trim().is_empty() {
        errors.reject("name", "is required");
    }
    if source.identifier_type.0.trim().is_empty() {
        errors.reject("identifier_type", "is required");
    }
    if source.retired
        && source
            .retire_reason
            .as_deref()
            .is_none_or(|r| r.trim().is_empty())
    {
        errors.reject("retire_reason", "is required when retiring a source");
    }

    match &source.kind {
        SourceKind::Sequential(config) => validate_sequential(config, &mut errors),
        SourceKind::Pool(config) => validate_pool(source, config, store, &mut errors)?,
        SourceKind::Remote(config) => validate_remote(config, &mut errors),
    }

    errors.into_result()
}

fn validate_sequential(config: &SequentialConfig, errors: &mut ValidationErrors) {
    let mut unique = HashSet::new();
    if config.base_character_set.chars().count() < 2 {
        errors.reject("base_character_set", "must contain at least two characters");
    } else if config.base_character_set.chars().any(char::is_whitespace) {
        errors.reject("base_character_set", "must not contain whitespace");
    } else if !config.base_character_set.chars().all(|c| unique.insert(c)) {
        errors.reject("base_character_set", "must not repeat characters");
    } else if let Err(Error::Validation(first)) = config.first_value() {
        for e in first.fields() {
            errors.reject(e.field, e.message.clone());
        }
    }

    for (field, value) in [("prefix", &config.prefix), ("suffix", &config.suffix)] {
        if value.as_deref().is_some_and(|v| v.chars().any(char::is_whitespace)) {
            errors.reject(field, "must not contain whitespace");
        }
    }

    if let (Some(min), Some(max)) = (config.min_length, config.max_length) {
        if min > max {
            errors.reject("min_length", "must not exceed max_length");
        }
    }

    if let Some(check_digit) = config.check_digit {
        let affixes = config.prefix.iter().chain(config.suffix.iter());
        let rejected = config
            .base_character_set
            .chars()
            .chain(affixes.flat_map(|s| s.chars()))
            .find(|&c| !check_digit.accepts(c));
        if let Some(c) = rejected {
            errors.reject(
                "check_digit",
                format!("'{c}' cannot be encoded by {check_digit:?}"),
            );
        }
    }

    if errors.is_empty() {
        match config.first_value().and_then(|first| config.format(first)) {
            Ok(Some(_)) => {}
            Ok(None) => errors.reject("max_length", "is shorter than the first identifier"),
            Err(Error::Validation(format_errors)) => {
                for e in format_errors.fields() {
                    errors.reject(e.field, e.message.clone());
                }
            }
            Err(e) => errors.reject("base_character_set", e.to_string()),
        }
    }
}

fn validate_pool(
    source: &IdentifierSource,
    config: &PoolConfig,
    store: &dyn SourceLookup,
    errors: &mut ValidationErrors,
) -> Result<()> {
    let Some(refill_source) = config.refill_source else {
        return Ok(());
    };

    if config.refill_batch_size == 0 {
        errors.reject("refill_batch_size", "must be greater than 0");
    }
    if source.id == Some(refill_source) {
        errors.reject("refill_source", "a pool cannot refill from itself");
        return Ok(());
    }

    let Some(upstream) = store.get_identifier_source(refill_source)? else {
        errors.reject("refill_source", format!("source {refill_source} does not exist"));
        return Ok(());
    };
    if upstream.identifier_type != source.identifier_type {
        errors.reject(
            "refill_source",
            format!(
                "source {refill_source} produces '{}', not '{}'",
                upstream.identifier_type, source.identifier_type
            ),
        );
    }

    // Follow the chain of pool refill sources looking for this pool.
    let mut visited = HashSet::from([refill_source]);
    let mut next = upstream.as_pool().and_then(|p| p.refill_source);
    while let Some(id) = next {
        if Some(id) == source.id || !visited.insert(id) {
            errors.reject("refill_source", "refill sources form a cycle");
            break;
        }
        next = store
            .get_identifier_source(id)?
            .and_then(|s| s.as_pool().and_then(|p| p.refill_source));
    }
    Ok(())
}

fn validate_remote(config: &RemoteConfig, errors: &mut ValidationErrors) {
    match reqwest::Url::parse(&config.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
        Ok(_) => errors.reject("url", "must be an http(s) URL"),
        Err(e) => errors.reject("url", format!("is not a valid URL: {e}")),
    }
    if config.password.is_some() && config.user.as_deref().is_none_or(str::is_empty) {
        errors.reject("user", "is required when a password is set");
    }
}
