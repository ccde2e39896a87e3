use std::io::{self, Write};
use std::time::Duration;

use around::model::Record;
use around::parser::{self, Command};

const DEFAULT_HOST: &str = "http://127.0.0.1:8080";
const IDENTITY_HEADER: &str = "x-authenticated-user";
const DEFAULT_USER: &str = "cli";

fn main() {
    print_banner();

    let host = std::env::var("AROUND_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let client = match reqwest::blocking::Client::builder().timeout(Duration::from_secs(60)).build() {
        Ok(c) => c,
        Err(e) => {
            println!("[\u{2717}] Could not build HTTP client: {}", e);
            return;
        }
    };

    match client.get(format!("{}/health", host)).send() {
        Ok(resp) if resp.status().is_success() => println!("[\u{2713}] Connected to around at {}!", host),
        _ => {
            println!("[\u{2717}] Could not reach server at {}.", host);
            println!("    Start it with 'cargo run --bin around' or set AROUND_HOST.");
            return;
        }
    }
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("around> ");
        if io::stdout().flush().is_err() { break; }
        buffer.clear();

        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if buffer.trim().is_empty() { continue; }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = execute_command(&client, &host, cmd) {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.to_uppercase().starts_with("POST") {
                    println!("    \u{2139}\u{fe0f}  Hint: Try 'POST \"hello\" AT 37.0, -122.0 WITH '/path/to/image.jpg''");
                } else if buffer.to_uppercase().starts_with("SEARCH") {
                    println!("    \u{2139}\u{fe0f}  Hint: Try 'SEARCH NEAR 37.0, -122.0 WITHIN 5'");
                }
            }
        }
    }
}

fn print_banner() {
    println!("\n==================================================");
    println!("   around CLI - posts near you");
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. POST:   POST \"message\" AT <lat>, <lon> WITH '<image path>' [AS <user>]");
    println!("2. SEARCH: SEARCH NEAR <lat>, <lon> [WITHIN <km>]");
    println!("3. EXIT:   Quit\n");
}

fn execute_command(client: &reqwest::blocking::Client, host: &str, cmd: Command) -> Result<(), String> {
    match cmd {
        Command::Help => { print_help(); Ok(()) },
        Command::Post { message, lat, lon, image, user } => {
            perform_post(client, host, message, lat, lon, &image, user.as_deref().unwrap_or(DEFAULT_USER))
        },
        Command::Search { lat, lon, range } => perform_search(client, host, &lat, &lon, range.as_deref()),
        Command::Exit => Ok(()),
    }
}

// --- NETWORK HANDLERS ---

fn error_message(resp: reqwest::blocking::Response) -> String {
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(v) => match v.get("message").and_then(|m| m.as_str()) {
            Some(m) => format!("{} ({})", m, status),
            None => format!("Server returned {}", status),
        },
        Err(_) => format!("Server returned {}: {}", status, body),
    }
}

fn perform_post(
    client: &reqwest::blocking::Client,
    host: &str,
    message: String,
    lat: String,
    lon: String,
    image: &str,
    user: &str,
) -> Result<(), String> {
    let form = reqwest::blocking::multipart::Form::new()
        .text("message", message)
        .text("lat", lat)
        .text("lon", lon)
        .file("image", image)
        .map_err(|e| format!("Cannot read image '{}': {}", image, e))?;

    let resp = client
        .post(format!("{}/post", host))
        .header(IDENTITY_HEADER, user)
        .multipart(form)
        .send()
        .map_err(|e| e.to_string())?;

    if resp.status().is_success() {
        println!("[\u{2713} OK] Posted as {}", user);
        Ok(())
    } else {
        Err(error_message(resp))
    }
}

fn perform_search(
    client: &reqwest::blocking::Client,
    host: &str,
    lat: &str,
    lon: &str,
    range: Option<&str>,
) -> Result<(), String> {
    let mut query = vec![("lat", lat), ("lon", lon)];
    if let Some(r) = range {
        query.push(("range", r));
    }

    let resp = client
        .get(format!("{}/search", host))
        .query(&query)
        .send()
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(error_message(resp));
    }

    let posts: Vec<Record> = resp.json().map_err(|e| e.to_string())?;
    println!("\nFound {} posts:", posts.len());
    for p in posts {
        println!("  \u{2022} {} @ ({:.4}, {:.4}): \"{}\"", p.author, p.location.lat, p.location.lon, p.text);
        if p.has_asset() {
            println!("      {}", p.asset_ref);
        }
    }
    println!();
    Ok(())
}
