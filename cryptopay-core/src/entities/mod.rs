pub mod dead_letters;
pub mod payment_sessions;
pub mod payouts;

use sqlx::Row;
use sqlx::postgres::PgRow;

/// Decode a TEXT column holding one of the SDK's string enums.
///
/// Enum columns are plain TEXT guarded by CHECK constraints, so the SDK
/// types stay free of sqlx derives.
pub(crate) fn text_column<T>(
    row: &PgRow,
    column: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_owned(),
        source: format!("unexpected value {raw:?}").into(),
    })
}
