//! # proxysync CLI
//!
//! Command-line utilities for inspecting and crafting protocol messages.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use proxysync_core::SubscriptionMessage;
use proxysync_proto::{ProxyEnvelope, TopicScheme};
use std::env;
use uuid::Uuid;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "topic" => {
            if args.len() < 3 {
                eprintln!("Usage: proxysync topic <engine-id> [tenant]");
                std::process::exit(1);
            }
            let engine = Uuid::parse_str(&args[2]).context("Invalid engine id")?;
            let scheme = args
                .get(3)
                .map_or_else(TopicScheme::default, |tenant| TopicScheme::new(tenant.as_str()));
            println!("inbox:  {}", scheme.inbox(engine));
            println!("status: {}", scheme.status(engine));
        }
        "encode" => {
            if args.len() < 3 {
                eprintln!("Usage: proxysync encode <message-json>");
                std::process::exit(1);
            }
            println!("{}", encode_message(&args[2])?);
        }
        "decode" => {
            if args.len() < 3 {
                eprintln!("Usage: proxysync decode <base64-cbor>");
                std::process::exit(1);
            }
            println!("{}", decode_message(&args[2])?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

/// JSON subscription message to base64 CBOR envelope.
fn encode_message(json: &str) -> Result<String> {
    let message: SubscriptionMessage =
        serde_json::from_str(json).context("Invalid subscription message JSON")?;
    let payload = ProxyEnvelope::new(message)
        .to_cbor()
        .context("Failed to encode envelope")?;
    Ok(STANDARD.encode(payload))
}

/// Base64 CBOR envelope to pretty-printed JSON message.
fn decode_message(encoded: &str) -> Result<String> {
    let payload = STANDARD
        .decode(encoded.trim())
        .context("Invalid base64")?;
    let envelope = ProxyEnvelope::from_cbor(&payload).context("Failed to decode envelope")?;
    serde_json::to_string_pretty(&envelope.into_message()).context("Failed to render JSON")
}

fn print_help() {
    println!(
        r#"proxysync CLI

USAGE:
    proxysync <COMMAND> [OPTIONS]

COMMANDS:
    topic <engine-id> [tenant]  Print the MQTT topics of an engine
    encode <message-json>       Encode a subscription message as base64 CBOR
    decode <base64-cbor>        Decode a base64 CBOR envelope to JSON
    help                        Show this help message

EXAMPLES:
    proxysync topic 6f1c2a4e-8f7b-4d2c-9a51-0c7e3b9d1f20
    proxysync encode '{{"message_type":"Reset","sender":"6f1c2a4e-8f7b-4d2c-9a51-0c7e3b9d1f20","bus":"bus-a","entries":[]}}'
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxysync_core::MessageType;

    #[test]
    fn decode_reverses_encode() {
        let sender = Uuid::new_v4();
        let json = format!(
            r#"{{"message_type":"Request","sender":"{sender}","bus":"bus-a","entries":[]}}"#
        );

        let decoded = decode_message(&encode_message(&json).unwrap()).unwrap();
        let message: SubscriptionMessage = serde_json::from_str(&decoded).unwrap();

        assert_eq!(message.message_type, MessageType::Request);
        assert_eq!(message.sender, sender);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_message("not base64!").is_err());
        assert!(decode_message(&STANDARD.encode(b"\xff\x00")).is_err());
    }
}
