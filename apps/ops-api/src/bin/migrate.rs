//! Standalone migration runner for ops-api.
//!
//! Usage:
//!   cargo run -p ops-api --bin ops-migrate
//!   cargo run -p ops-api --bin ops-migrate -- --test
//!   cargo run -p ops-api --bin ops-migrate -- --revert
//!
//! Reads DATABASE_URL from the environment (or .env via dotenvy).

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use ops_api::config::{load_dotenv, with_test_db_suffix};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

fn main() {
    load_dotenv();

    let args: Vec<String> = std::env::args().collect();
    let has_flag = |flag: &str| args.iter().any(|arg| arg == flag);

    let Ok(mut database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL env var is required");
        std::process::exit(2);
    };
    if has_flag("--test") {
        database_url = with_test_db_suffix(&database_url);
    }

    println!("Connecting to database...");
    let mut conn = match PgConnection::establish(&database_url) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("failed to connect to database: {e}");
            std::process::exit(1);
        }
    };

    if has_flag("--revert") {
        match conn.revert_last_migration(MIGRATIONS) {
            Ok(version) => println!("  Reverted: {version}"),
            Err(e) => {
                eprintln!("failed to revert migration: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    println!("Running pending migrations...");
    let applied = match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => applied,
        Err(e) => {
            eprintln!("failed to run migrations: {e}");
            std::process::exit(1);
        }
    };

    if applied.is_empty() {
        println!("No pending migrations.");
    } else {
        for migration in &applied {
            println!("  Applied: {migration}");
        }
        println!("{} migration(s) applied.", applied.len());
    }
}
