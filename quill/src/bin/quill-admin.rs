// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of quill.
//
// quill is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// quill is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with quill.  If not, see
// <http://www.gnu.org/licenses/>.

//! # quill-admin
//!
//! Operator tasks that have no place on the site itself: creating & listing groups, and removing
//! posts or users. quill-admin talks directly to the database named in the quilld configuration
//! file.

use std::path::PathBuf;

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use itertools::Itertools;
use snafu::prelude::*;
use tracing::{debug, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Registry};

use quill::{
    config::{self, parse_config},
    entities::{self, GroupSlug, PostId, Username},
    sqlite,
    storage::{self, Backend},
};

/// The quill-admin error type; [Debug] is implemented in terms of [Display](std::fmt::Display)
/// for the sake of readable messages on exit.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Config { source: config::Error },
    #[snafu(display("Failed to connect to the database: {source}"))]
    Database {
        #[snafu(source(from(sqlite::Error, Box::new)))]
        source: Box<sqlite::Error>,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Invalid group slug: {source}"))]
    Slug { source: entities::Error },
    #[snafu(display("{source}"))]
    Storage { source: storage::Error },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
    #[snafu(display("No such {what}: {name}"))]
    Unknown { what: &'static str, name: String },
    #[snafu(display("Invalid username: {source}"))]
    Username { source: entities::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          sub-commands                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn add_group(storage: &sqlite::Session, matches: &ArgMatches) -> Result<()> {
    // clap enforces the presence of all three.
    let title = matches.get_one::<String>("title").cloned().unwrap_or_default();
    let slug = matches.get_one::<String>("slug").cloned().unwrap_or_default();
    let description = matches
        .get_one::<String>("description")
        .cloned()
        .unwrap_or_default();
    let slug = GroupSlug::new(&slug).context(SlugSnafu)?;
    let group = storage
        .add_group(&title, &slug, &description)
        .await
        .context(StorageSnafu)?;
    info!("Added group {} ({}).", group.slug(), group.id());
    println!("{}", group.slug());
    Ok(())
}

async fn list_groups(storage: &sqlite::Session) -> Result<()> {
    let groups = storage.groups().await.context(StorageSnafu)?;
    println!(
        "{}",
        groups
            .iter()
            .map(|g| format!("{}\t{}\t{}", g.slug(), g.title(), g.description()))
            .join("\n")
    );
    Ok(())
}

async fn delete_post(storage: &sqlite::Session, matches: &ArgMatches) -> Result<()> {
    let id = matches.get_one::<i64>("id").copied().unwrap_or_default();
    if !storage
        .delete_post(PostId::new(id))
        .await
        .context(StorageSnafu)?
    {
        return UnknownSnafu {
            what: "post",
            name: id.to_string(),
        }
        .fail();
    }
    info!("Deleted post {}.", id);
    Ok(())
}

async fn delete_user(storage: &sqlite::Session, matches: &ArgMatches) -> Result<()> {
    let name = matches
        .get_one::<String>("username")
        .cloned()
        .unwrap_or_default();
    let username = Username::new(&name).context(UsernameSnafu)?;
    let user = storage
        .user_for_name(&username)
        .await
        .context(StorageSnafu)?
        .context(UnknownSnafu {
            what: "user",
            name: name.clone(),
        })?;
    storage
        .delete_user(&user.id())
        .await
        .context(StorageSnafu)?;
    info!("Deleted user {} along with their posts, comments & follows.", username);
    Ok(())
}

async fn go_async(cfg: Option<PathBuf>, matches: ArgMatches) -> Result<()> {
    let cfg = parse_config(&cfg).context(ConfigSnafu)?;
    debug!("Connecting to {}.", cfg.database.url);
    let storage = sqlite::Session::new(&cfg.database.url, cfg.database.max_connections)
        .await
        .context(DatabaseSnafu)?;

    let res = match matches.subcommand() {
        Some(("add-group", sub)) => add_group(&storage, sub).await,
        Some(("list-groups", _)) => list_groups(&storage).await,
        Some(("delete-post", sub)) => delete_post(&storage, sub).await,
        Some(("delete-user", sub)) => delete_user(&storage, sub).await,
        // `subcommand_required` rules this out
        _ => Ok(()),
    };

    storage.close().await;
    res
}

fn main() -> Result<()> {
    let matches = Command::new("quill-admin")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Administer a quill site")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("QUILL_CONFIG")
                .help("path to the quilld configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("QUILL_VERBOSE")
                .help("produce prolix output"),
        )
        .subcommand(
            Command::new("add-group")
                .about("Create a new group")
                .arg(Arg::new("title").required(true).help("the group's title"))
                .arg(Arg::new("slug").required(true).help("the group's URL slug"))
                .arg(
                    Arg::new("description")
                        .required(true)
                        .help("a short description of the group"),
                ),
        )
        .subcommand(Command::new("list-groups").about("List all groups"))
        .subcommand(
            Command::new("delete-post").about("Remove a post & its comments").arg(
                Arg::new("id")
                    .required(true)
                    .value_parser(value_parser!(i64))
                    .help("the post's id"),
            ),
        )
        .subcommand(
            Command::new("delete-user")
                .about("Remove a user along with their posts, comments & follows")
                .arg(Arg::new("username").required(true)),
        )
        .get_matches();

    let level = if matches.get_flag("verbose") {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let subscriber = Registry::default()
        .with(fmt::Layer::default().compact().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let _guard = tracing::subscriber::set_default(subscriber);

    let cfg = matches.get_one::<PathBuf>("config").cloned();
    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(cfg, matches))
}
