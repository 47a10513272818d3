//! Subcommand execution. Every command prints JSON on stdout.

use std::sync::mpsc;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::info;

use homedb_core::config::Settings;
use homedb_core::daemon::Daemon;
use homedb_core::query::ClientQuery;
use homedb_core::{TreeClient, Transforms};

use crate::Command;


pub fn run(command: Command, settings: &Settings) -> Result<()> {
    match command {
        Command::Serve => serve(settings),
        Command::Stop => {
            connect(settings)?.shutdown_server().context("stop failed")?;
            print_json(&json!({ "stopped": settings.client_endpoint().to_string() }))
        }
        Command::Ls { path } => {
            let children = connect(settings)?.list_children(&path)?;
            print_json(&children)
        }
        Command::Mk { parent, name, kind } => {
            let client = connect(settings)?;
            match kind {
                Some(kind) => client.create_child_of_kind(&parent, &name, &kind)?,
                None => client.create_child(&parent, &name)?,
            }
            print_json(&json!({ "created": join_path(&parent, &name) }))
        }
        Command::Rm { parent, name } => {
            connect(settings)?.remove_child(&parent, &name)?;
            print_json(&json!({ "removed": join_path(&parent, &name) }))
        }
        Command::Get { path } => {
            let node = connect(settings)?.get_node(&path)?;
            print_json(&node)
        }
        Command::Query {
            selector,
            attrs,
            css,
            parent,
            children,
            empty,
        } => {
            let client = connect(settings)?;
            let mut query = client.query(&selector);
            if parent {
                query = query.parent();
            }
            if children {
                query = query.children();
            }
            if empty {
                query = query.empty();
            }
            query = apply_pairs(query, &attrs, Transforms::attr, Transforms::set_attr)?;
            query = apply_pairs(query, &css, Transforms::css, Transforms::set_css)?;
            let result = query.run()?;
            print_json(&result)
        }
        Command::Watch { target } => watch(settings, &target),
    }
}


fn serve(settings: &Settings) -> Result<()> {
    let endpoint = settings.server_endpoint();
    let daemon = Daemon::bind(&endpoint, &settings.server)?;
    info!(endpoint = %daemon.endpoint(), "serving");
    daemon.run()?;
    Ok(())
}


fn watch(settings: &Settings, target: &str) -> Result<()> {
    let client = connect(settings)?;
    let (tx, rx) = mpsc::channel();
    let id = client.subscribe(target, move |push| {
        let _ = tx.send(push.clone());
    })?;
    info!(subscription = id, target, "watching");
    // Ends when the connection drops and the callback is released.
    for push in rx {
        println!("{}", serde_json::to_string(&push)?);
    }
    Ok(())
}


fn connect(settings: &Settings) -> Result<TreeClient> {
    let endpoint = settings.client_endpoint();
    TreeClient::connect(&endpoint, &settings.client)
        .with_context(|| format!("cannot reach homedb at {}", endpoint))
}


/// Apply `NAME` as a read and `NAME=VALUE` as a write, in order.
fn apply_pairs<'c>(
    mut query: ClientQuery<'c>,
    pairs: &[String],
    read: fn(ClientQuery<'c>, &str) -> ClientQuery<'c>,
    write: fn(ClientQuery<'c>, &str, &str) -> ClientQuery<'c>,
) -> Result<ClientQuery<'c>> {
    for pair in pairs {
        query = match split_pair(pair)? {
            (name, Some(value)) => write(query, name, value),
            (name, None) => read(query, name),
        };
    }
    Ok(query)
}


fn split_pair(pair: &str) -> Result<(&str, Option<&str>)> {
    let (name, value) = match pair.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (pair, None),
    };
    if name.is_empty() {
        bail!("missing name in '{}'", pair);
    }
    Ok((name, value))
}


fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}


fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_read_and_write() {
        assert_eq!(split_pair("on").unwrap(), ("on", None));
        assert_eq!(split_pair("on=1").unwrap(), ("on", Some("1")));
        assert_eq!(split_pair("label=a=b").unwrap(), ("label", Some("a=b")));
        assert_eq!(split_pair("on=").unwrap(), ("on", Some("")));
        assert!(split_pair("=1").is_err());
    }

    #[test]
    fn join_path_handles_root() {
        assert_eq!(join_path("/", "room"), "/room");
        assert_eq!(join_path("/room", "kitchen"), "/room/kitchen");
    }
}
