//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from a given TOML string if it is not `None`.
/// Returns `Ok(config)` on success and `Err(RosterError)` on parser failure
/// or on encountering a field name outside the allowed list.
///
/// Example:
/// ```no_run
/// let config = parsed_config!(config_str => RosterConfig; dead_server_timeout_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+ $(,)?) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, RosterError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if the table is not empty at this point, some parsed keys were
            // not expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err(RosterError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::RosterError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        timeout_ms: u64,
        locator: String,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                timeout_ms: 250,
                locator: "tcp:host=coord".into(),
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), RosterError> {
        let config = parsed_config!(None => TestConfig; timeout_ms, locator)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), RosterError> {
        let config_str = Some("timeout_ms = 500");
        let config = parsed_config!(config_str => TestConfig; timeout_ms, locator)?;
        assert_eq!(
            config,
            TestConfig {
                timeout_ms: 500,
                locator: "tcp:host=coord".into(),
            }
        );
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("password = 'hunter2'");
        assert!(parsed_config!(config_str => TestConfig; timeout_ms).is_err());
    }
}
