use serde_json::{json, Value};
use toolbridge::errors::ToolbridgeError;
use toolbridge::query::{QueryBuilder, QueryRequest, MAX_LIMIT};

fn builder() -> QueryBuilder {
    QueryBuilder::new(vec![
        "users".to_string(),
        "notes".to_string(),
        "documents".to_string(),
    ])
    .expect("valid builder")
}

fn request(value: Value) -> QueryRequest {
    serde_json::from_value(value).expect("valid request shape")
}

#[test]
fn select_binds_values_instead_of_interpolating() {
    let hostile = "x@example.com; DROP TABLE users;";
    let statement = builder()
        .build(&request(json!({
            "action": "select",
            "table": "users",
            "where": { "email": hostile },
        })))
        .expect("statement builds");

    assert!(!statement.text.contains("DROP TABLE"));
    assert!(statement.text.contains("email = $1"));
    assert_eq!(statement.values, vec![json!(hostile)]);
}

#[test]
fn select_clamps_limit_and_applies_ordering() {
    let statement = builder()
        .build(&request(json!({
            "action": "select",
            "table": "notes",
            "limit": 5000,
            "offset": 20,
            "order_by": "created_at",
            "order_direction": "DESC",
        })))
        .expect("statement builds");

    assert!(statement.text.contains(&format!("LIMIT {MAX_LIMIT}")));
    assert!(statement.text.contains("OFFSET 20"));
    assert!(statement.text.contains("ORDER BY created_at DESC"));
}

#[test]
fn order_direction_is_coerced_to_asc_or_desc() {
    let statement = builder()
        .build(&request(json!({
            "action": "select",
            "table": "notes",
            "order_by": "title",
            "order_direction": "DESC; DROP TABLE notes",
        })))
        .expect("statement builds");

    assert!(statement.text.contains("ORDER BY title ASC"));
    assert!(!statement.text.contains("DROP TABLE"));
}

#[test]
fn null_filter_value_becomes_is_null() {
    let statement = builder()
        .build(&request(json!({
            "action": "select",
            "table": "documents",
            "where": { "deleted_at": null, "owner": "ana" },
        })))
        .expect("statement builds");

    assert!(statement.text.contains("deleted_at IS NULL"));
    assert!(statement.text.contains("owner = $1"));
    assert_eq!(statement.values, vec![json!("ana")]);
}

#[test]
fn insert_builds_positional_placeholders() {
    let statement = builder()
        .build(&request(json!({
            "action": "insert",
            "table": "notes",
            "data": { "body": "hello", "title": "greeting" },
        })))
        .expect("statement builds");

    assert!(statement.text.starts_with("INSERT INTO notes"));
    assert!(statement.text.contains("($1, $2)"));
    assert!(statement.text.ends_with("RETURNING *"));
    assert_eq!(statement.values.len(), 2);
}

#[test]
fn update_and_delete_require_where() {
    let err = builder()
        .build(&request(json!({
            "action": "update",
            "table": "users",
            "data": { "name": "updated" },
        })))
        .expect_err("update without where must fail");
    assert!(matches!(err, ToolbridgeError::MissingRequiredField("where")));

    let err = builder()
        .build(&request(json!({
            "action": "delete",
            "table": "users",
            "where": {},
        })))
        .expect_err("delete with empty where must fail");
    assert!(matches!(err, ToolbridgeError::MissingRequiredField("where")));
}

#[test]
fn insert_requires_data() {
    let err = builder()
        .build(&request(json!({ "action": "insert", "table": "users" })))
        .expect_err("insert without data must fail");
    assert!(matches!(err, ToolbridgeError::MissingRequiredField("data")));
}

#[test]
fn rejects_tables_outside_the_allow_list() {
    let err = builder()
        .build(&request(json!({ "action": "select", "table": "secrets" })))
        .expect_err("unknown table must fail");
    assert!(matches!(err, ToolbridgeError::TableNotAllowed(_)));
}

#[test]
fn rejects_invalid_column_identifiers() {
    for column in ["email; --", "1starts_with_digit", "has space", "quo\"te"] {
        let err = builder()
            .build(&request(json!({
                "action": "select",
                "table": "users",
                "where": { column: 1 },
            })))
            .expect_err("bad column must fail");
        assert!(matches!(err, ToolbridgeError::ColumnNameInvalid(_)));
    }
}

#[test]
fn update_places_where_binds_after_set_binds() {
    let statement = builder()
        .build(&request(json!({
            "action": "update",
            "table": "users",
            "data": { "name": "ana" },
            "where": { "id": 7 },
        })))
        .expect("statement builds");

    assert!(statement.text.contains("SET name = $1"));
    assert!(statement.text.contains("WHERE id = $2"));
    assert_eq!(statement.values, vec![json!("ana"), json!(7)]);
}

#[test]
fn count_supports_optional_filter() {
    let statement = builder()
        .build(&request(json!({ "action": "count", "table": "notes" })))
        .expect("statement builds");
    assert_eq!(statement.text, "SELECT COUNT(*) AS count FROM notes");
    assert!(statement.values.is_empty());
}
