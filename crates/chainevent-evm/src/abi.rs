//! ABI sources: built-in token standards or JSON files on disk.

use alloy_json_abi::JsonAbi;
use serde::Deserialize;

use chainevent_core::error::ConfigError;

pub const ERC20: &str = include_str!("../abi/erc20.json");
pub const ERC721: &str = include_str!("../abi/erc721.json");
pub const ERC1155: &str = include_str!("../abi/erc1155.json");

/// Built-in ABIs, addressable by name in configuration.
pub const BUILTIN: &[(&str, &str)] = &[("erc20", ERC20), ("erc721", ERC721), ("erc1155", ERC1155)];

/// Look up a built-in ABI by (case-insensitive) name.
pub fn builtin(name: &str) -> Option<&'static str> {
    BUILTIN
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, abi)| *abi)
}

/// Resolve an ABI reference to its JSON text.
///
/// `source` is either a built-in name (`erc20`, `erc721`, `erc1155`) or a
/// path to a JSON file.
pub fn resolve(source: &str) -> Result<String, ConfigError> {
    if let Some(abi) = builtin(source) {
        return Ok(abi.to_string());
    }
    Ok(std::fs::read_to_string(source)?)
}

/// Compiler artifacts wrap the ABI under an `abi` key.
#[derive(Deserialize)]
struct Artifact {
    abi: JsonAbi,
}

/// Parse ABI JSON: a bare ABI array or an artifact object with an `abi` key.
pub fn parse(alias: &str, json: &str) -> Result<JsonAbi, ConfigError> {
    match serde_json::from_str::<JsonAbi>(json) {
        Ok(abi) => Ok(abi),
        Err(bare_err) => serde_json::from_str::<Artifact>(json)
            .map(|a| a.abi)
            .map_err(|_| ConfigError::InvalidAbi {
                alias: alias.to_string(),
                reason: bare_err.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_parse() {
        for (name, json) in BUILTIN {
            let abi = parse(name, json).unwrap();
            assert!(abi.events().count() >= 2, "{name} has too few events");
        }
    }

    #[test]
    fn builtin_lookup_is_case_insensitive() {
        assert!(builtin("ERC20").is_some());
        assert!(builtin("erc4626").is_none());
    }

    #[test]
    fn erc20_transfer_selector() {
        let abi = parse("t", ERC20).unwrap();
        let transfer = abi.events().find(|e| e.name == "Transfer").unwrap();
        assert_eq!(
            format!("0x{}", hex::encode(transfer.selector())),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn artifact_wrapper_accepted() {
        let wrapped = format!("{{\"contractName\":\"Token\",\"abi\":{ERC20}}}");
        let abi = parse("t", &wrapped).unwrap();
        assert!(abi.events().any(|e| e.name == "Approval"));
    }

    #[test]
    fn garbage_is_invalid_abi() {
        let err = parse("usdt", "{not json").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAbi { alias, .. } if alias == "usdt"));
    }

    #[test]
    fn resolve_missing_file_is_io_error() {
        let err = resolve("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
