//! Name conversions between metadata identifiers and SQL identifiers.

use heck::{ToLowerCamelCase, ToPascalCase, ToSnakeCase};

/// Naive pluralization of English words, applied to the last word of a
/// PascalCase or camelCase name.
/// e.g. "Family" -> "Families", "Address" -> "Addresses", "Project" -> "Projects"
pub fn pluralize(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.ends_with('y')
        && !lower.ends_with("ay")
        && !lower.ends_with("ey")
        && !lower.ends_with("oy")
        && !lower.ends_with("uy")
    {
        format!("{}ies", &word[..word.len() - 1])
    } else if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        format!("{word}es")
    } else {
        format!("{word}s")
    }
}

/// Table holding the rows of a top-level record.
/// e.g. "Family" -> "families", "SiteVisitReport" -> "site_visit_reports"
pub fn table_name(record_name: &str) -> String {
    pluralize(record_name).to_snake_case()
}

/// Composite type backing a nested record.
/// e.g. "ContactDetail" -> "contact_detail"
pub fn type_name(record_name: &str) -> String {
    record_name.to_snake_case()
}

/// SQL column/attribute name for a field key.
/// e.g. "modifiedDateTime" -> "modified_date_time"
pub fn column_name(field: &str) -> String {
    field.to_snake_case()
}

/// Field key for a live SQL column/attribute name.
pub fn field_name(column: &str) -> String {
    column.to_lower_camel_case()
}

/// Record name for a live composite type name.
pub fn record_name(type_name: &str) -> String {
    type_name.to_pascal_case()
}

/// Column key under which a reverse relationship is exposed.
/// e.g. "Quotation" -> "quotations"
pub fn relationship_name(record_name: &str) -> String {
    pluralize(record_name).to_lower_camel_case()
}

/// Quote an identifier for inclusion in SQL text.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal for inclusion in SQL text.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
