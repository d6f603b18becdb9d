//! Client/server table and column renaming (spec §6 "Name mapping").
//!
//! Applied at poke-merger ingress, before a merged patch reaches the view:
//! server-side table and column names are translated to whatever names the
//! local query pipeline was built against. Embedders with no renaming use
//! [`IdentityNameMapper`].

/// Translates server-side identifiers to client-side ones.
pub trait NameMapper {
    /// The client-facing name for a server table name. Defaults to
    /// returning `server_table` unchanged.
    fn map_table(&self, server_table: &str) -> String {
        server_table.to_string()
    }

    /// The client-facing name for a column of `server_table`. Defaults to
    /// returning `server_column` unchanged.
    fn map_column(&self, server_table: &str, server_column: &str) -> String {
        let _ = server_table;
        server_column.to_string()
    }
}

/// A [`NameMapper`] that performs no renaming at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityNameMapper;

impl NameMapper for IdentityNameMapper {}
