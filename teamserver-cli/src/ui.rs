use std::path::Path;

use teamserver_engine::UserStatus;
use teamserver_engine::config::ListenerEntry;

/// Prints the daemon startup banner.
pub fn print_banner(app: &str, host: &str, port: u16, root: &Path) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║                  team server daemon                  ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  App     : {app:<41} ║");
    println!("║  Listen  : {:<41} ║", format!("{host}:{port}"));
    println!("║  Root    : {:<41} ║", root.display().to_string());
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

pub fn print_users(users: &[UserStatus]) {
    if users.is_empty() {
        println!("No users.");
        return;
    }
    println!("{:<24} {:<8} LAST SEEN", "NAME", "STATUS");
    for user in users {
        let status = if user.online { "online" } else { "offline" };
        let last_seen = user
            .last_seen
            .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string());
        println!("{:<24} {status:<8} {last_seen}", user.name);
    }
}

pub fn print_entries(entries: &[ListenerEntry]) {
    if entries.is_empty() {
        println!("No persistent listeners.");
        return;
    }
    println!("{:<12} {:<10} ADDRESS", "ID", "TRANSPORT");
    for entry in entries {
        println!(
            "{:<12} {:<10} {}:{}",
            entry.id, entry.transport, entry.host, entry.port
        );
    }
}
