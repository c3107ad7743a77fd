use std::{collections::HashMap, fmt, str::FromStr};

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{Document, DocumentType, PlaceholderDefinition, User},
    schema::{document_types, documents, placeholder_definitions, users},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataSource {
    Document,
    User,
    System,
    Static,
}

impl DataSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Document => "DOCUMENT",
            DataSource::User => "USER",
            DataSource::System => "SYSTEM",
            DataSource::Static => "STATIC",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DOCUMENT" => Ok(DataSource::Document),
            "USER" => Ok(DataSource::User),
            "SYSTEM" => Ok(DataSource::System),
            "STATIC" => Ok(DataSource::Static),
            _ => Err(format!(
                "invalid data source '{value}'. Allowed: DOCUMENT, USER, SYSTEM, STATIC"
            )),
        }
    }
}

pub fn validate_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 100;
    if valid {
        Ok(())
    } else {
        Err(format!(
            "placeholder name '{name}' must be an uppercase identifier (A-Z, 0-9, _)"
        ))
    }
}

/// Everything a placeholder may read from.
pub struct ResolveSources<'a> {
    pub document: &'a Document,
    pub document_type: Option<&'a DocumentType>,
    pub author: Option<&'a User>,
    pub reviewer: Option<&'a User>,
    pub approver: Option<&'a User>,
    pub now: NaiveDateTime,
}

fn document_field(sources: &ResolveSources<'_>, field: &str) -> Option<String> {
    let document = sources.document;
    match field {
        "document_number" | "number" => Some(document.document_number.clone()),
        "title" => Some(document.title.clone()),
        "description" => Some(document.description.clone()),
        "version" => Some(format!(
            "{}.{}",
            document.version_major, document.version_minor
        )),
        "status" => Some(document.status.clone()),
        "effective_date" => document.effective_date.map(|date| date.to_string()),
        "obsolescence_date" => document.obsolescence_date.map(|date| date.to_string()),
        "reason_for_change" => Some(document.reason_for_change.clone()),
        "document_type" | "type" => sources.document_type.map(|t| t.name.clone()),
        "type_code" => sources.document_type.map(|t| t.code.clone()),
        _ => None,
    }
}

fn user_field(sources: &ResolveSources<'_>, path: &str) -> Option<String> {
    let (role, attribute) = path.split_once('.').unwrap_or((path, "full_name"));
    let user = match role {
        "author" => sources.author,
        "reviewer" => sources.reviewer,
        "approver" => sources.approver,
        _ => None,
    }?;
    match attribute {
        "full_name" | "name" => Some(user.full_name()),
        "username" => Some(user.username.clone()),
        "email" => Some(user.email.clone()),
        "first_name" => Some(user.first_name.clone()),
        "last_name" => Some(user.last_name.clone()),
        _ => None,
    }
}

fn system_field(now: NaiveDateTime, field: &str) -> Option<String> {
    match field {
        "date" | "current_date" => Some(now.format("%Y-%m-%d").to_string()),
        "time" | "current_time" => Some(now.format("%H:%M").to_string()),
        "datetime" | "current_datetime" => Some(now.format("%Y-%m-%d %H:%M").to_string()),
        "year" => Some(now.format("%Y").to_string()),
        _ => None,
    }
}

/// Value of `definition`, falling back to its default and then to the empty string.
pub fn resolve_value(definition: &PlaceholderDefinition, sources: &ResolveSources<'_>) -> String {
    let field = definition.field_path.trim();
    let resolved = match definition.data_source.parse::<DataSource>() {
        Ok(DataSource::Document) => document_field(sources, field),
        Ok(DataSource::User) => user_field(sources, field),
        Ok(DataSource::System) => system_field(sources.now, field),
        Ok(DataSource::Static) | Err(_) => None,
    };
    resolved
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| definition.default_value.clone())
}

/// Replaces `{{NAME}}` tokens found in `values`. Unknown tokens stay as written.
pub fn render(template: &str, values: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let token = &after_open[..end];
                // An unclosed opener before the real token: keep it as text.
                if let Some(inner) = token.rfind("{{") {
                    output.push_str(&rest[start..start + 2 + inner]);
                    rest = &after_open[inner..];
                    continue;
                }
                match values.get(token.trim()) {
                    Some(value) => output.push_str(value),
                    None => {
                        output.push_str("{{");
                        output.push_str(token);
                        output.push_str("}}");
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

#[derive(Debug, Serialize)]
pub struct ResolvedPlaceholder {
    pub name: String,
    pub display_name: String,
    pub data_source: String,
    pub value: String,
}

fn load_user(conn: &mut PgConnection, id: Option<Uuid>) -> AppResult<Option<User>> {
    match id {
        Some(id) => Ok(users::table.find(id).first(conn).optional()?),
        None => Ok(None),
    }
}

pub fn resolve_for_document(
    conn: &mut PgConnection,
    document_id: Uuid,
    now: NaiveDateTime,
) -> AppResult<Vec<ResolvedPlaceholder>> {
    let document: Document = documents::table
        .find(document_id)
        .first(conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    let document_type: Option<DocumentType> = document_types::table
        .find(document.document_type_id)
        .first(conn)
        .optional()?;
    let author = load_user(conn, Some(document.author_id))?;
    let reviewer = load_user(conn, document.reviewer_id)?;
    let approver = load_user(conn, document.approver_id)?;

    let definitions: Vec<PlaceholderDefinition> = placeholder_definitions::table
        .filter(placeholder_definitions::is_active.eq(true))
        .order(placeholder_definitions::name.asc())
        .load(conn)?;

    let sources = ResolveSources {
        document: &document,
        document_type: document_type.as_ref(),
        author: author.as_ref(),
        reviewer: reviewer.as_ref(),
        approver: approver.as_ref(),
        now,
    };

    Ok(definitions
        .iter()
        .map(|definition| ResolvedPlaceholder {
            name: definition.name.clone(),
            display_name: definition.display_name.clone(),
            data_source: definition.data_source.clone(),
            value: resolve_value(definition, &sources),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn definition(name: &str, source: &str, path: &str, default: &str) -> PlaceholderDefinition {
        PlaceholderDefinition {
            id: Uuid::new_v4(),
            name: name.into(),
            display_name: name.into(),
            description: String::new(),
            data_source: source.into(),
            field_path: path.into(),
            default_value: default.into(),
            is_active: true,
            created_at: at(2026, 1, 1),
            updated_at: at(2026, 1, 1),
        }
    }

    fn user(first: &str, last: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: "jdoe".into(),
            email: "jdoe@example.com".into(),
            first_name: first.into(),
            last_name: last.into(),
            password_hash: String::new(),
            is_active: true,
            is_superuser: false,
            last_login: None,
            created_at: at(2026, 1, 1),
            updated_at: at(2026, 1, 1),
        }
    }

    fn document(author: &User) -> Document {
        Document {
            id: Uuid::new_v4(),
            document_number: "SOP-2026-0003".into(),
            title: "Line clearance".into(),
            description: String::new(),
            document_type_id: Uuid::new_v4(),
            document_source_id: None,
            status: "DRAFT".into(),
            version_major: 2,
            version_minor: 1,
            author_id: author.id,
            reviewer_id: None,
            approver_id: None,
            reason_for_change: String::new(),
            effective_date: None,
            obsolescence_date: None,
            obsolescence_reason: None,
            supersedes_id: None,
            file_key: None,
            file_name: None,
            file_content_type: None,
            file_size: None,
            file_checksum: None,
            created_at: at(2026, 1, 1),
            updated_at: at(2026, 1, 1),
        }
    }

    #[test]
    fn resolves_each_data_source() {
        let author = user("Jane", "Doe");
        let doc = document(&author);
        let sources = ResolveSources {
            document: &doc,
            document_type: None,
            author: Some(&author),
            reviewer: None,
            approver: None,
            now: at(2026, 4, 2),
        };

        let cases = [
            (definition("DOC_NUMBER", "DOCUMENT", "document_number", ""), "SOP-2026-0003"),
            (definition("VERSION", "DOCUMENT", "version", ""), "2.1"),
            (definition("AUTHOR", "USER", "author.full_name", ""), "Jane Doe"),
            (definition("REVIEWER", "USER", "reviewer.full_name", "TBD"), "TBD"),
            (definition("TODAY", "SYSTEM", "date", ""), "2026-04-02"),
            (definition("SITE", "STATIC", "", "Plant 4"), "Plant 4"),
            (definition("EFFECTIVE", "DOCUMENT", "effective_date", ""), ""),
        ];
        for (def, expected) in cases {
            assert_eq!(resolve_value(&def, &sources), expected, "{}", def.name);
        }
    }

    #[test]
    fn render_leaves_unknown_tokens() {
        let values = HashMap::from([
            ("TITLE".to_string(), "Line clearance".to_string()),
            ("VERSION".to_string(), "2.1".to_string()),
        ]);
        let rendered = render("{{TITLE}} v{{ VERSION }} by {{AUTHOR}} {{broken", &values);
        assert_eq!(rendered, "Line clearance v2.1 by {{AUTHOR}} {{broken");
    }

    #[test]
    fn render_skips_unclosed_openers() {
        let values = HashMap::from([
            ("TITLE".to_string(), "Line clearance".to_string()),
            ("VERSION".to_string(), "2.1".to_string()),
        ]);
        assert_eq!(render("{{ {{TITLE}}", &values), "{{ Line clearance");
        assert_eq!(
            render("a {{ b {{ c {{VERSION}} d {{TITLE", &values),
            "a {{ b {{ c 2.1 d {{TITLE"
        );
        assert_eq!(render("{{{{TITLE}}}}", &values), "{{Line clearance}}");
    }

    #[test]
    fn validates_names() {
        assert!(validate_name("DOC_NUMBER2").is_ok());
        assert!(validate_name("doc").is_err());
        assert!(validate_name("2DOC").is_err());
        assert!(validate_name("").is_err());
    }
}
