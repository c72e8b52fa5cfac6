// ABOUTME: emits json schemas for the scriptboxd request and response frames to stdout.
// ABOUTME: lets clients in other languages build requests and parse frames without linking this crate.

use std::collections::BTreeMap;

fn main() -> Result<(), serde_json::Error> {
    let mut schemas = BTreeMap::new();
    schemas.insert("request", schemars::schema_for!(scriptbox_common::Request));
    schemas.insert("frame", schemars::schema_for!(scriptbox_common::Frame));
    println!("{}", serde_json::to_string_pretty(&schemas)?);
    Ok(())
}
