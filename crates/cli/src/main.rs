/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::io::{BufRead, Write};
use std::time::Duration;

use clap::{Parser, Subcommand};
use store::{Store, StoreConfig};

#[derive(Parser)]
#[command(name = "aox", about = "Loriot mail server administration", version)]
struct Cli {
    /// Path to the server configuration file.
    #[arg(short, long, default_value = "/etc/loriot/loriot.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List resources.
    List {
        #[command(subcommand)]
        what: ListCommand,
    },
    /// Create resources.
    Add {
        #[command(subcommand)]
        what: AddCommand,
    },
    /// Delete resources.
    Delete {
        #[command(subcommand)]
        what: DeleteCommand,
    },
    /// Change attributes of existing resources.
    Change {
        #[command(subcommand)]
        what: ChangeCommand,
    },
}

#[derive(Subcommand)]
enum ListCommand {
    /// List all users with their addresses.
    Users,
}

#[derive(Subcommand)]
enum AddCommand {
    /// Create a user with an INBOX and an address alias.
    User {
        login: String,
        /// Prompt for the password instead of generating one.
        #[arg(short = 'p')]
        prompt_password: bool,
        address: String,
    },
}

#[derive(Subcommand)]
enum DeleteCommand {
    /// Delete a user. Refuses when mailboxes still hold mail unless forced.
    User {
        /// Force deletion of nonempty mailboxes.
        #[arg(short = 'f')]
        force: bool,
        login: String,
    },
}

#[derive(Subcommand)]
enum ChangeCommand {
    /// Set a new password.
    Password {
        login: String,
        #[arg(short = 'p')]
        prompt_password: bool,
    },
    /// Rename a user, moving their mailboxes along.
    Username { old: String, new: String },
    /// Point a login at a different address.
    Address { login: String, address: String },
}

fn read_password(prompt: bool) -> String {
    if prompt {
        print!("Password: ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        line.trim_end_matches(['\r', '\n']).to_string()
    } else {
        // A random secret the operator can replace later.
        let mut secret = String::with_capacity(16);
        let mut seed = std::process::id() as u64 ^ store::now() as u64;
        for _ in 0..16 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let ch = b"abcdefghjkmnpqrstuvwxyz23456789"[(seed >> 33) as usize % 31];
            secret.push(ch as char);
        }
        println!("Generated password: {}", secret);
        secret
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match common::config::Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("aox: {}", err);
            std::process::exit(1);
        }
    };
    let store = match Store::open(
        StoreConfig {
            host: config.store.host.clone(),
            port: config.store.port,
            database: config.store.database.clone(),
            user: config.store.user.clone(),
            password: config.store.password.clone(),
            max_connections: 2,
            connect_timeout: Duration::from_secs(10),
        },
        false,
    )
    .await
    {
        Ok(store) => store,
        Err(err) => {
            eprintln!("aox: {}", err);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::List {
            what: ListCommand::Users,
        } => store.list_users().await.map(|users| {
            for (login, address) in users {
                println!("{}\t{}", login, address.unwrap_or_default());
            }
        }),
        Command::Add {
            what:
                AddCommand::User {
                    login,
                    prompt_password,
                    address,
                },
        } => {
            let secret = read_password(prompt_password);
            store.create_user(&login, &secret, &address).await.map(|user| {
                println!("Created user {} (id {})", user.login, user.id);
            })
        }
        Command::Delete {
            what: DeleteCommand::User { force, login },
        } => match store.delete_user(&login, force).await {
            Ok(Ok(())) => {
                println!("Deleted user {}", login);
                Ok(())
            }
            Ok(Err(occupied)) => {
                eprintln!("aox: user {} still has mail in:", login);
                for name in occupied {
                    eprintln!("  {}", name);
                }
                eprintln!("aox: use -f to delete anyway");
                std::process::exit(-1);
            }
            Err(err) => Err(err),
        },
        Command::Change { what } => match what {
            ChangeCommand::Password {
                login,
                prompt_password,
            } => {
                let secret = read_password(prompt_password);
                store.change_password(&login, &secret).await
            }
            ChangeCommand::Username { old, new } => store.change_username(&old, &new).await,
            ChangeCommand::Address { login, address } => {
                store.change_address(&login, &address).await
            }
        },
    };

    if let Err(err) = result {
        eprintln!("aox: {}", err);
        std::process::exit(1);
    }
}
