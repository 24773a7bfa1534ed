// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! JVM-style method argument descriptors.
//!
//! A descriptor such as `"Ljava/lang/String;ILjava/util/Map;"` packs one
//! token per argument: a single letter for a primitive (`V Z B C D F I J
//! S`), `L<binary-name>;` for a reference type, or one or more leading `[`
//! for an array of either. Tokenised by hand below rather than with a
//! regex crate, since the grammar is a simple one-pass scan.

/// Splits a raw descriptor string into its argument tokens (e.g.
/// `"ILjava/lang/String;"` -> `["I", "Ljava/lang/String;"]`).
///
/// A descriptor that runs out of bytes mid-token (a trailing `[` with no
/// type letter after it, or an `L` with no closing `;`) stops the scan and
/// returns whatever complete tokens came before it, rather than reading
/// past the end of the string.
fn tokenize(desc: &str) -> Vec<&str> {
    let bytes = desc.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i] == b'[' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        if bytes[i] == b'L' {
            let mut closed = false;
            while i < bytes.len() {
                i += 1;
                if i < bytes.len() && bytes[i] == b';' {
                    i += 1;
                    closed = true;
                    break;
                }
            }
            if !closed {
                break;
            }
        } else {
            i += 1;
        }
        tokens.push(&desc[start..i]);
    }
    tokens
}

/// Converts a raw argument descriptor into the list of Dubbo/Java type
/// names it names, one per argument.
///
/// Descriptor byte `S` decodes to `"int"`, not `"short"`: the readers on
/// the other end of this wire never distinguish a Java short from an int,
/// so the two collapse to the same argument type name here. An empty or
/// otherwise unrecognised token is dropped rather than treated as a
/// decode failure, same as the rest of this function's tolerance of
/// malformed input.
pub fn descriptor_to_type_names(desc: &str) -> Vec<String> {
    tokenize(desc)
        .into_iter()
        .filter_map(|token| {
            let depth = token.bytes().take_while(|&b| b == b'[').count();
            let rest = &token[depth..];
            let first = rest.as_bytes().first()?;
            let base = match first {
                b'V' => "void".to_string(),
                b'Z' => "boolean".to_string(),
                b'B' => "byte".to_string(),
                b'C' => "char".to_string(),
                b'D' => "double".to_string(),
                b'F' => "float".to_string(),
                b'I' => "int".to_string(),
                b'J' => "long".to_string(),
                b'S' => "int".to_string(),
                b'L' if rest.len() >= 2 => rest[1..rest.len() - 1].replace('/', "."),
                _ => return None,
            };
            Some(if depth > 0 {
                format!("{}{}", "[".repeat(depth), base.replace('.', "/"))
            } else {
                base
            })
        })
        .collect()
}

/// The inverse of [`descriptor_to_type_names`]: builds a raw argument
/// descriptor from a list of Java/Dubbo type names, used when building a
/// request frame from call arguments.
pub fn type_names_to_descriptor(type_names: &[String]) -> String {
    type_names
        .iter()
        .map(|name| match name.as_str() {
            "int" => "I".to_string(),
            "long" => "J".to_string(),
            "void" => "V".to_string(),
            "boolean" => "Z".to_string(),
            "byte" => "B".to_string(),
            "char" => "C".to_string(),
            "short" => "S".to_string(),
            "float" => "F".to_string(),
            "double" => "D".to_string(),
            other if other.starts_with('[') => other.replace('.', "/"),
            other => format!("L{};", other.replace('.', "/")),
        })
        .collect()
}
