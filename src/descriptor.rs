//! Method descriptor parsing.
use regex::Regex;

use crate::errors::VmError;

/// Argument descriptors of a method descriptor, in declaration order.
///
/// `(I[CLjava/lang/String;)V` yields `["I", "[C", "Ljava/lang/String"]`:
/// class types keep their leading `L` but drop the trailing `;`, which is
/// the shape the invocation prologue matches against.
pub fn parse_args(descriptor: &str) -> Result<Vec<String>, VmError> {
    let re = Regex::new(r"\(([^\)]*)\)(.+)").unwrap();
    let caps = re
        .captures(descriptor)
        .ok_or_else(|| VmError::ClassFormat(format!("bad method descriptor '{descriptor}'")))?;
    let mut rest = caps.get(1).map_or("", |m| m.as_str());

    let mut args = Vec::new();
    while !rest.is_empty() {
        let (arg, remainder) = take_one(rest, descriptor)?;
        args.push(arg);
        rest = remainder;
    }
    Ok(args)
}

/// Number of declared arguments in a method descriptor.
pub fn arg_count(descriptor: &str) -> Result<usize, VmError> {
    Ok(parse_args(descriptor)?.len())
}

/// Split one argument descriptor off the front of `rest`.
fn take_one<'a>(rest: &'a str, whole: &str) -> Result<(String, &'a str), VmError> {
    let bad = || VmError::ClassFormat(format!("bad method descriptor '{whole}'"));
    let Some(&lead) = rest.as_bytes().first() else {
        return Err(bad());
    };
    match lead {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => {
            Ok((rest[..1].to_string(), &rest[1..]))
        }
        b'L' => {
            let end = rest.find(';').ok_or_else(bad)?;
            Ok((rest[..end].to_string(), &rest[end + 1..]))
        }
        b'[' => {
            let (element, remainder) = take_one(&rest[1..], whole)?;
            Ok((format!("[{element}"), remainder))
        }
        _ => Err(bad()),
    }
}
