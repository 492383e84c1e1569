use crate::state::EntityKind;

/// Default key expression prefix for the bridge.
pub const KEY_PREFIX: &str = "modbus_sw";

/// Suffix appended to an entity key to address its command channel.
pub const COMMAND_SUFFIX: &str = "set";

/// Builder for the bridge's key expressions.
///
/// State keys follow `<prefix>/<port>/<slave>/<kind><address>`, command keys
/// append `/set`.
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    /// Create a builder with a custom prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Append a suffix to the prefix.
    pub fn build(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, suffix)
        }
    }

    /// Key on which an entity's state is published.
    ///
    /// # Example
    /// ```
    /// use modbus_sw_common::keyexpr::KeyExprBuilder;
    /// use modbus_sw_common::state::EntityKind;
    ///
    /// let key = KeyExprBuilder::default().state_key("P1", 5, EntityKind::Coil, 3);
    /// assert_eq!(key, "modbus_sw/P1/5/coil3");
    /// ```
    pub fn state_key(&self, port: &str, slave_id: u8, kind: EntityKind, address: u16) -> String {
        format!(
            "{}/{}/{}/{}{}",
            self.prefix,
            port,
            slave_id,
            kind.as_str(),
            address
        )
    }

    /// Key on which the host sends switch commands for a coil.
    pub fn command_key(&self, port: &str, slave_id: u8, address: u16) -> String {
        format!(
            "{}/{}",
            self.state_key(port, slave_id, EntityKind::Coil, address),
            COMMAND_SUFFIX
        )
    }

    /// Wildcard matching every command key of this bridge.
    ///
    /// # Example
    /// ```
    /// use modbus_sw_common::keyexpr::KeyExprBuilder;
    ///
    /// assert_eq!(KeyExprBuilder::default().command_wildcard(), "modbus_sw/*/*/*/set");
    /// ```
    pub fn command_wildcard(&self) -> String {
        format!("{}/*/*/*/{}", self.prefix, COMMAND_SUFFIX)
    }

    /// Key for bridge status messages.
    pub fn status_key(&self) -> String {
        format!("{}/@/status", self.prefix)
    }

    /// Parse a state or command key produced by this builder.
    ///
    /// Returns `None` if the key does not carry this builder's prefix or does
    /// not name a coil/input.
    pub fn parse<'a>(&self, key: &'a str) -> Option<ParsedKeyExpr<'a>> {
        let rest = key.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        parse_key_expr(rest)
    }
}

/// Parse `<port>/<slave>/<kind><address>[/set]` (prefix already removed).
pub fn parse_key_expr(key: &str) -> Option<ParsedKeyExpr<'_>> {
    let parts: Vec<&str> = key.split('/').collect();

    let command = match parts.len() {
        3 => false,
        4 if parts[3] == COMMAND_SUFFIX => true,
        _ => return None,
    };

    let port = parts[0];
    if port.is_empty() {
        return None;
    }
    let slave_id: u8 = parts[1].parse().ok()?;

    let (kind, address) = if let Some(address) = parts[2].strip_prefix("coil") {
        (EntityKind::Coil, address)
    } else if let Some(address) = parts[2].strip_prefix("input") {
        (EntityKind::Input, address)
    } else {
        return None;
    };
    let address: u16 = address.parse().ok()?;

    Some(ParsedKeyExpr {
        port,
        slave_id,
        kind,
        address,
        command,
    })
}

/// Parsed components of a bridge key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKeyExpr<'a> {
    pub port: &'a str,
    pub slave_id: u8,
    pub kind: EntityKind,
    pub address: u16,
    /// Whether the key addresses the command channel.
    pub command: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builder() {
        let builder = KeyExprBuilder::default();

        assert_eq!(
            builder.state_key("P1", 5, EntityKind::Input, 2),
            "modbus_sw/P1/5/input2"
        );
        assert_eq!(builder.command_key("P1", 5, 3), "modbus_sw/P1/5/coil3/set");
        assert_eq!(builder.status_key(), "modbus_sw/@/status");
        assert_eq!(builder.build("P1/5/coil0"), "modbus_sw/P1/5/coil0");
    }

    #[test]
    fn test_parse_command_key() {
        let builder = KeyExprBuilder::new("home/relays");
        let parsed = builder.parse("home/relays/P1/5/coil3/set").unwrap();

        assert_eq!(parsed.port, "P1");
        assert_eq!(parsed.slave_id, 5);
        assert_eq!(parsed.kind, EntityKind::Coil);
        assert_eq!(parsed.address, 3);
        assert!(parsed.command);
    }

    #[test]
    fn test_parse_state_key() {
        let parsed = KeyExprBuilder::default()
            .parse("modbus_sw/P1/12/input7")
            .unwrap();

        assert_eq!(parsed.kind, EntityKind::Input);
        assert_eq!(parsed.address, 7);
        assert!(!parsed.command);
    }

    #[test]
    fn test_parse_invalid_key() {
        let builder = KeyExprBuilder::default();
        assert!(builder.parse("invalid/key").is_none());
        assert!(builder.parse("modbus_sw/P1/5/relay3").is_none());
        assert!(builder.parse("modbus_sw/P1/999/coil3").is_none());
        assert!(builder.parse("modbus_sw/P1/5/coil3/get").is_none());
        assert!(builder.parse("other/P1/5/coil3").is_none());
    }
}
