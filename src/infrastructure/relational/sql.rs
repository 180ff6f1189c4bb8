//! Statement builders for the relational adapter
//!
//! T-SQL for SQL Server stores. Identifiers come from a validated
//! [`SchemaCatalog`] and are always bracketed; values are always bound to
//! `@Pn` parameters. Builders are pure so the exact SQL is unit tested
//! without a server.

use chrono::NaiveDate;

use crate::domain::{
    ComparisonFilters, DateRange, ReferenceCollection, ScannableCollection, Window,
};

/// A value bound to a positional `@Pn` parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Text(String),
    Int(i64),
    Date(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    fn new(sql: String, params: Vec<Param>) -> Self {
        Self { sql, params }
    }
}

/// Text columns are normalized to this type before reaching the adapter.
const TEXT: &str = "NVARCHAR(4000)";

/// Names of every base table in the store database.
pub fn table_probe() -> Statement {
    Statement::new(
        "SELECT CAST(TABLE_NAME AS NVARCHAR(128)) AS table_name \
         FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_TYPE = 'BASE TABLE'"
            .to_string(),
        Vec::new(),
    )
}

pub fn quote(identifier: &str) -> String {
    format!("[{}]", identifier.replace(']', "]]"))
}

fn qualified(alias: &str, identifier: &str) -> String {
    format!("{alias}.{}", quote(identifier))
}

/// `@Pstart, @Pstart+1, ...` for `count` parameters.
pub fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|n| format!("@P{n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn text(expression: &str) -> String {
    format!("CAST({expression} AS {TEXT})")
}

fn text_or_null(alias: &str, field: Option<&str>) -> String {
    text(&field.map_or_else(|| "NULL".to_string(), |f| qualified(alias, f)))
}

fn has_code(alias: &str, code_field: &str) -> String {
    let code = qualified(alias, code_field);
    format!("{code} IS NOT NULL AND {code} <> ''")
}

/// Rows of any catalog collection holding exactly `code`.
pub fn locate(
    collection: &str,
    primary_key: &str,
    code_field: &str,
    description_field: Option<&str>,
    code: &str,
) -> Statement {
    let sql = format!(
        "SELECT CAST({pk} AS BIGINT) AS pk, {description} AS description \
         FROM {table} t WHERE {code} = @P1 ORDER BY {pk}",
        pk = qualified("t", primary_key),
        description = text_or_null("t", description_field),
        table = quote(collection),
        code = qualified("t", code_field),
    );
    Statement::new(sql, vec![Param::Text(code.to_string())])
}

/// Batched code rewrite guarded by the old code: `@P1` new, `@P2` old, then keys.
pub fn replace_batch(
    collection: &str,
    primary_key: &str,
    code_field: &str,
    new_code: &str,
    old_code: &str,
    keys: &[i64],
) -> Statement {
    let sql = format!(
        "UPDATE {table} SET {code} = @P1 WHERE {code} = @P2 AND {pk} IN ({keys})",
        table = quote(collection),
        code = quote(code_field),
        pk = quote(primary_key),
        keys = placeholders(3, keys.len()),
    );
    let mut params = vec![Param::Text(new_code.to_string()), Param::Text(old_code.to_string())];
    params.extend(keys.iter().copied().map(Param::Int));
    Statement::new(sql, params)
}

/// FROM clause, non-empty-code filter and date filter for a detail scan.
/// Returns the body and its date params, which are numbered from `@P1`.
fn detail_scope(collection: &ScannableCollection, range: &DateRange) -> (String, Vec<Param>) {
    let mut body = format!("FROM {} d", quote(&collection.name));
    let mut conditions = vec![has_code("d", &collection.code_field)];
    let mut params = Vec::new();

    if let (Some(header), false) = (&collection.header, range.is_unbounded()) {
        body.push_str(&format!(
            " INNER JOIN {} h ON {} = {}",
            quote(&header.collection),
            qualified("h", &header.header_key),
            qualified("d", &header.foreign_key),
        ));
        let date = qualified("h", &header.date_field);
        if let Some(from) = range.from {
            params.push(Param::Date(from));
            conditions.push(format!("{date} >= @P{}", params.len()));
        }
        if let Some(until) = range.upper_exclusive() {
            params.push(Param::Date(until));
            conditions.push(format!("{date} < @P{}", params.len()));
        }
    }

    body.push_str(" WHERE ");
    body.push_str(&conditions.join(" AND "));
    (body, params)
}

pub fn count_rows(collection: &ScannableCollection, range: &DateRange) -> Statement {
    let (scope, params) = detail_scope(collection, range);
    Statement::new(format!("SELECT COUNT_BIG(*) AS total {scope}"), params)
}

/// Orphans among rows `(offset, offset + limit]` of the numbered detail scan.
pub fn orphan_window(
    reference: &ReferenceCollection,
    collection: &ScannableCollection,
    window: Window,
    range: &DateRange,
) -> Statement {
    let (scope, mut params) = detail_scope(collection, range);
    let lower = params.len() + 1;
    let upper = params.len() + 2;
    params.push(Param::Int(i64::try_from(window.offset).unwrap_or(i64::MAX)));
    params.push(Param::Int(i64::try_from(window.end()).unwrap_or(i64::MAX)));

    let sql = format!(
        "WITH numbered AS (\
            SELECT {pk} AS pk, {secondary} AS secondary_key, {description} AS description, \
                   {code} AS code, \
                   ROW_NUMBER() OVER (ORDER BY {pk}) AS row_num \
            {scope}\
         ) \
         SELECT CAST(n.pk AS BIGINT) AS pk, n.secondary_key, n.description, n.code \
         FROM numbered n \
         WHERE n.row_num > @P{lower} AND n.row_num <= @P{upper} \
           AND NOT EXISTS (SELECT 1 FROM {reference} r WHERE {reference_code} = n.code) \
         ORDER BY n.row_num",
        pk = qualified("d", &collection.primary_key),
        secondary = text_or_null("d", collection.secondary_key_field.as_deref()),
        description = text_or_null("d", collection.description_field.as_deref()),
        code = text(&qualified("d", &collection.code_field)),
        reference = quote(&reference.name),
        reference_code = qualified("r", &reference.code_field),
    );
    Statement::new(sql, params)
}

/// Distinct reference codes among `codes`.
pub fn existence(reference: &ReferenceCollection, codes: &[String]) -> Statement {
    let sql = format!(
        "SELECT DISTINCT {text_code} AS code FROM {table} r WHERE {code} IN ({keys})",
        text_code = text(&qualified("r", &reference.code_field)),
        code = qualified("r", &reference.code_field),
        table = quote(&reference.name),
        keys = placeholders(1, codes.len()),
    );
    Statement::new(sql, codes.iter().cloned().map(Param::Text).collect())
}

/// Reference code for the product keyed by `value` on its primary key.
pub fn lookup_by_secondary_key(reference: &ReferenceCollection, value: &str) -> Statement {
    let sql = format!(
        "SELECT TOP (1) {code} AS code FROM {table} r \
         WHERE {pk} = @P1 AND {non_empty} ORDER BY {pk_column}",
        code = text(&qualified("r", &reference.code_field)),
        table = quote(&reference.name),
        pk = text(&qualified("r", &reference.primary_key)),
        pk_column = qualified("r", &reference.primary_key),
        non_empty = has_code("r", &reference.code_field),
    );
    Statement::new(sql, vec![Param::Text(value.to_string())])
}

/// Reference code for the first product whose description equals `value`.
pub fn lookup_by_description(reference: &ReferenceCollection, value: &str) -> Statement {
    let sql = format!(
        "SELECT TOP (1) {code} AS code FROM {table} r \
         WHERE {description} = @P1 AND {non_empty} ORDER BY {pk}",
        code = text(&qualified("r", &reference.code_field)),
        table = quote(&reference.name),
        description = qualified("r", &reference.description_field),
        non_empty = has_code("r", &reference.code_field),
        pk = qualified("r", &reference.primary_key),
    );
    Statement::new(sql, vec![Param::Text(value.to_string())])
}

/// WHERE clause for comparison filters. Filters on fields the reference
/// collection does not declare are ignored.
fn product_scope(reference: &ReferenceCollection, filters: &ComparisonFilters) -> (String, Vec<Param>) {
    let mut conditions = vec![has_code("r", &reference.code_field)];
    let mut params = Vec::new();

    let mut id_filter = |field: Option<&str>, ids: &[i64], params: &mut Vec<Param>| {
        if let (Some(field), false) = (field, ids.is_empty()) {
            let start = params.len() + 1;
            params.extend(ids.iter().copied().map(Param::Int));
            conditions.push(format!(
                "CAST({} AS BIGINT) IN ({})",
                qualified("r", field),
                placeholders(start, ids.len())
            ));
        }
    };
    id_filter(reference.category_field.as_deref(), &filters.category_ids, &mut params);
    id_filter(reference.subcategory_field.as_deref(), &filters.subcategory_ids, &mut params);

    if let (Some(field), false) = (&reference.discontinued_field, filters.include_discontinued) {
        conditions.push(format!(
            "COALESCE(CAST({} AS INT), 0) = 0",
            qualified("r", field)
        ));
    }

    (format!("FROM {} r WHERE {}", quote(&reference.name), conditions.join(" AND ")), params)
}

pub fn count_products(reference: &ReferenceCollection, filters: &ComparisonFilters) -> Statement {
    let (scope, params) = product_scope(reference, filters);
    Statement::new(format!("SELECT COUNT_BIG(*) AS total {scope}"), params)
}

pub fn products_window(
    reference: &ReferenceCollection,
    filters: &ComparisonFilters,
    window: Window,
) -> Statement {
    let (scope, mut params) = product_scope(reference, filters);
    let offset = params.len() + 1;
    let limit = params.len() + 2;
    params.push(Param::Int(i64::try_from(window.offset).unwrap_or(i64::MAX)));
    params.push(Param::Int(i64::try_from(window.limit).unwrap_or(i64::MAX)));

    let bigint_or_null = |field: Option<&str>| {
        field.map_or_else(
            || "CAST(NULL AS BIGINT)".to_string(),
            |f| format!("CAST({} AS BIGINT)", qualified("r", f)),
        )
    };
    let discontinued = reference.discontinued_field.as_deref().map_or_else(
        || "CAST(0 AS BIT)".to_string(),
        |f| {
            format!(
                "CAST(CASE WHEN COALESCE(CAST({} AS INT), 0) <> 0 THEN 1 ELSE 0 END AS BIT)",
                qualified("r", f)
            )
        },
    );

    let sql = format!(
        "SELECT CAST({pk} AS BIGINT) AS pk, {code} AS code, {description} AS description, \
                {category} AS category_id, {subcategory} AS subcategory_id, \
                {discontinued} AS discontinued \
         {scope} ORDER BY {pk} OFFSET @P{offset} ROWS FETCH NEXT @P{limit} ROWS ONLY",
        pk = qualified("r", &reference.primary_key),
        code = text(&qualified("r", &reference.code_field)),
        description = text(&qualified("r", &reference.description_field)),
        category = bigint_or_null(reference.category_field.as_deref()),
        subcategory = bigint_or_null(reference.subcategory_field.as_deref()),
    );
    Statement::new(sql, params)
}

/// Single-row rewrite guarded by the code the row held when audited.
pub fn replace_row(
    collection: &str,
    primary_key: &str,
    code_field: &str,
    key: i64,
    orphaned_code: &str,
    replacement_code: &str,
) -> Statement {
    let sql = format!(
        "UPDATE {table} SET {code} = @P1 WHERE {pk} = @P2 AND {code} = @P3",
        table = quote(collection),
        code = quote(code_field),
        pk = quote(primary_key),
    );
    Statement::new(
        sql,
        vec![
            Param::Text(replacement_code.to_string()),
            Param::Int(key),
            Param::Text(orphaned_code.to_string()),
        ],
    )
}
