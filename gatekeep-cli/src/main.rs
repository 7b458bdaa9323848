//! Gatekeep - password-gated control of BLE door and user components
//!
//! Usage:
//!   GATEKEEP_HOME=/tmp/gatekeep gatekeep <command>
//!
//! Commands:
//!   setup [--service ID] [--characteristic ID] [--user-service ID --user-characteristic ID]
//!   run [--password PASS] [--poll-ms N] [--scan-ms N] [--door-name NAME] [--user-name NAME]
//!   reset [--forget]              - Choose a new password, or delete the stored config
//!   scan [--duration SECS]        - List nearby BLE peripherals

mod console;
mod settings;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use gatekeep_ble::BtleplugTransport;
use gatekeep_proto::ble::{DEFAULT_CHARACTERISTIC_ID, DEFAULT_SERVICE_ID};
use gatekeep_proto::commands;
use gatekeep_session::{
    config, AuthError, Authenticator, GattIds, Session, SessionConfig, SessionError, SessionHandle,
    SlotSnapshot,
};
use log::info;

use console::{Console, Input};
use settings::Settings;

#[derive(Parser)]
#[command(name = "gatekeep")]
#[command(about = "Password-gated control of BLE door and user components")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a password and the GATT ids of the components
    Setup {
        /// Door service id
        #[arg(long, default_value = DEFAULT_SERVICE_ID)]
        service: String,
        /// Door characteristic id
        #[arg(long, default_value = DEFAULT_CHARACTERISTIC_ID)]
        characteristic: String,
        /// User component service id
        #[arg(long, requires = "user_characteristic")]
        user_service: Option<String>,
        /// User component characteristic id
        #[arg(long, requires = "user_service")]
        user_characteristic: Option<String>,
        /// Password (prompted for when missing)
        #[arg(long)]
        password: Option<String>,
    },
    /// Connect to the configured components and control them
    Run {
        /// Password (prompted for when missing)
        #[arg(long)]
        password: Option<String>,
        /// Poll interval in milliseconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        poll_ms: Option<u64>,
        /// Scan window in milliseconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        scan_ms: Option<u64>,
        /// Advertised name of the door component
        #[arg(long)]
        door_name: Option<String>,
        /// Advertised name of the user component
        #[arg(long)]
        user_name: Option<String>,
    },
    /// Choose a new password for the stored config
    Reset {
        /// Delete the stored config instead
        #[arg(long)]
        forget: bool,
    },
    /// List nearby BLE peripherals
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

enum Outcome {
    Quit,
    Reset,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let home = settings::gatekeep_home()?;
    let mut console = Console::new();

    match cli.command {
        Commands::Setup {
            service,
            characteristic,
            user_service,
            user_characteristic,
            password,
        } => {
            let mut slots = vec![GattIds::new(service, characteristic)];
            if let (Some(service), Some(characteristic)) = (user_service, user_characteristic) {
                slots.push(GattIds::new(service, characteristic));
            }
            cmd_setup(&home, &mut console, slots, password).await?
        }
        Commands::Run {
            password,
            poll_ms,
            scan_ms,
            door_name,
            user_name,
        } => {
            let mut settings = Settings::load_or_create(&home)?;
            if let Some(ms) = poll_ms {
                settings.session.poll_interval = Duration::from_millis(ms);
            }
            if let Some(ms) = scan_ms {
                settings.session.scan_window = Duration::from_millis(ms);
            }
            if let Some(name) = door_name {
                settings.advertised_names.insert("door".to_string(), name);
            }
            if let Some(name) = user_name {
                settings.advertised_names.insert("user".to_string(), name);
            }
            cmd_run(&home, &mut console, settings, password).await?
        }
        Commands::Reset { forget } => cmd_reset(&home, &mut console, forget).await?,
        Commands::Scan { duration } => cmd_scan(&home, duration).await?,
    }

    Ok(())
}

async fn cmd_setup(
    home: &Path,
    console: &mut Console,
    slots: Vec<GattIds>,
    password: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut auth = Authenticator::load(settings::data_path(home))?;
    if auth.state().is_configured {
        println!("Replacing the config at {}", auth.path().display());
    }

    let password = match password {
        Some(password) => password,
        None => read_new_password(console).await?,
    };

    auth.configure(SessionConfig { password, slots })?;
    println!("Config saved to {}", auth.path().display());
    Ok(())
}

async fn cmd_run(
    home: &Path,
    console: &mut Console,
    settings: Settings,
    password: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut auth = Authenticator::load(settings::data_path(home))?;
    if !auth.state().is_configured {
        return Err("no password set yet, run `gatekeep setup` first".into());
    }
    authenticate(&mut auth, console, password).await?;

    let transport = Arc::new(BtleplugTransport::with_default_adapter().await?);

    loop {
        let config = auth.config().cloned().ok_or("config went missing")?;
        let slots = settings.slots(&config)?;

        let (session, task) =
            Session::spawn(Arc::clone(&transport), slots, settings.session.clone()).await?;
        let outcome = control(&session, console).await;
        session.shutdown().await;
        let _ = task.await;

        match outcome? {
            Outcome::Quit => break,
            Outcome::Reset => {
                auth.reset_password();
                println!("Password reset");
                let password = read_new_password(console).await?;
                let slots = reenter_ids(console, config.slots).await?;
                auth.configure(SessionConfig { password, slots })?;
            }
        }
    }

    Ok(())
}

async fn cmd_reset(
    home: &Path,
    console: &mut Console,
    forget: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = settings::data_path(home);

    // no load first, so an unreadable file can still be removed
    if forget {
        config::remove(&path)?;
        println!("Removed {}", path.display());
        return Ok(());
    }

    let mut auth = Authenticator::load(&path)?;

    let Some(config) = auth.config().cloned() else {
        println!("Nothing to reset, run `gatekeep setup` first");
        return Ok(());
    };

    auth.reset_password();
    let password = read_new_password(console).await?;
    let slots = reenter_ids(console, config.slots).await?;
    auth.configure(SessionConfig { password, slots })?;
    println!("Config saved to {}", auth.path().display());
    Ok(())
}

async fn cmd_scan(home: &Path, duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load_or_create(home)?;

    println!("Scanning for BLE devices ({} seconds)...", duration);
    let devices = gatekeep_ble::scan(Duration::from_secs(duration)).await?;

    if devices.is_empty() {
        println!("\nNo devices found.");
        println!("Make sure your components are powered on and advertising.");
        return Ok(());
    }

    println!("\nFound {} devices:", devices.len());
    for device in &devices {
        let rssi = device.rssi.map(|r| format!(" ({}dBm)", r)).unwrap_or_default();
        let role = settings
            .advertised_names
            .iter()
            .find(|(_, name)| **name == device.name)
            .map(|(role, _)| format!(" [{role}]"))
            .unwrap_or_default();
        println!("  {} - {}{}{}", device.name, device.address, rssi, role);
    }

    Ok(())
}

async fn authenticate(
    auth: &mut Authenticator,
    console: &mut Console,
    password: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(password) = password {
        auth.check_password(&password)?;
        return Ok(());
    }

    loop {
        let Some(candidate) = console.prompt("Password: ").await? else {
            return Err("no password given".into());
        };
        match auth.check_password(&candidate) {
            Ok(()) => return Ok(()),
            Err(AuthError::Mismatch) => println!("Password not recognized"),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn read_new_password(console: &mut Console) -> Result<String, Box<dyn std::error::Error>> {
    loop {
        let Some(password) = console.prompt("Set a password: ").await? else {
            return Err("no password given".into());
        };
        if password.is_empty() {
            println!("Password must not be empty");
            continue;
        }
        return Ok(password);
    }
}

/// Offer each stored id for change; a blank answer keeps it
async fn reenter_ids(
    console: &mut Console,
    slots: Vec<GattIds>,
) -> Result<Vec<GattIds>, Box<dyn std::error::Error>> {
    let mut updated = Vec::with_capacity(slots.len());
    for (ids, role) in slots.into_iter().zip(settings::ROLES) {
        let answer = console
            .prompt(&format!("{role} service id [{}]: ", ids.service_id))
            .await?;
        let service_id = console::keep_or_replace(answer.as_deref(), &ids.service_id);

        let answer = console
            .prompt(&format!("{role} characteristic id [{}]: ", ids.characteristic_id))
            .await?;
        let characteristic_id =
            console::keep_or_replace(answer.as_deref(), &ids.characteristic_id);

        updated.push(GattIds::new(service_id, characteristic_id));
    }
    Ok(updated)
}

/// Render slot changes and forward commands until the user quits or resets
async fn control(
    session: &SessionHandle,
    console: &mut Console,
) -> Result<Outcome, Box<dyn std::error::Error>> {
    let mut snapshots = session.snapshots();
    print_status(&snapshots.borrow_and_update());
    println!("{}", console::HELP);

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(Outcome::Quit);
                }
                print_status(&snapshots.borrow_and_update());
            }

            line = console.next_line() => {
                let Some(line) = line? else {
                    return Ok(Outcome::Quit);
                };
                match console::parse_command(&line) {
                    Ok(Input::Lock(role)) => send(session, &role, commands::LOCK).await?,
                    Ok(Input::Unlock(role)) => send(session, &role, commands::UNLOCK).await?,
                    Ok(Input::Status) => print_status(&session.snapshot()),
                    Ok(Input::Reset) => return Ok(Outcome::Reset),
                    Ok(Input::Quit) => return Ok(Outcome::Quit),
                    Ok(Input::Empty) => {}
                    Err(message) => println!("{message}"),
                }
            }
        }
    }
}

async fn send(
    session: &SessionHandle,
    role: &str,
    value: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    match session.write(role, value).await {
        Ok(()) => {
            info!("sent {value} to {role}");
            Ok(())
        }
        Err(SessionError::NotReady(role)) => {
            println!("{}", console::not_ready_message(&role));
            Ok(())
        }
        Err(SessionError::UnknownRole(role)) => {
            println!("No component called {role}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_status(slots: &[SlotSnapshot]) {
    for slot in slots {
        println!("{}", console::render_slot(slot));
    }
}
