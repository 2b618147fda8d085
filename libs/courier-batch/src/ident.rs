use courier_api::StorageError;

/// Validate a table or column name before it is spliced into SQL.
/// Allowed: `^[a-zA-Z_][a-zA-Z0-9_.]*$`.
pub fn validate_identifier(name: &str, context: &str) -> Result<(), StorageError> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(StorageError::config(format!("{context}: identifier is empty")));
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(StorageError::config(format!(
            "{context}: invalid identifier '{name}', must start with a letter or underscore"
        )));
    }
    for ch in chars {
        if !ch.is_ascii_alphanumeric() && ch != '_' && ch != '.' {
            return Err(StorageError::config(format!(
                "{context}: invalid character '{ch}' in identifier '{name}'"
            )));
        }
    }
    Ok(())
}
