use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

use medconnect_portal::auth::{FileStorage, OAuthProvider};
use medconnect_portal::bootstrap::{AuthSnapshot, SignUpForm};
use medconnect_portal::error::{Error, Result};
use medconnect_portal::notify::Notification;
use medconnect_portal::profile::{Organization, UserType};
use medconnect_portal::routes::GuardDecision;
use medconnect_portal::services::{NewReport, Report, ReportFile, ReportStatus};
use medconnect_portal::views::{Catalog, OrganizationDashboard, PatientDashboard};
use medconnect_portal::{config::PortalConfig, Portal};

#[derive(Parser, Debug)]
#[clap(name = "medconnect", version)]
#[clap(about = "MedConnect portal client", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// Directory the session is persisted in
    #[clap(long, env = "MEDCONNECT_STATE_DIR", default_value = ".medconnect")]
    state_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an account
    Signup {
        email: String,
        #[clap(long, env = "MEDCONNECT_PASSWORD")]
        password: String,
        #[clap(long)]
        name: String,
        /// patient, doctor, clinic, pharmacy or laboratory
        #[clap(long, default_value = "patient")]
        user_type: UserType,
    },
    /// Sign in with email and password
    Login {
        email: String,
        #[clap(long, env = "MEDCONNECT_PASSWORD")]
        password: String,
        /// Location to return to after signing in
        #[clap(long)]
        from: Option<String>,
    },
    /// Print the provider sign-in URL
    OauthUrl {
        provider: OAuthProvider,
        #[clap(long, default_value = "http://localhost:3000")]
        origin: Url,
    },
    /// Complete an OAuth sign-in from the redirect URL
    Callback { url: Url },
    /// Sign out
    Logout,
    /// Show the current session and profile
    Whoami,
    /// Evaluate a navigation to `path`
    Route { path: String },
    /// Medical reports
    Reports {
        #[clap(subcommand)]
        command: ReportCommands,
    },
    /// Organization profile of a professional account
    Org {
        #[clap(subcommand)]
        command: OrgCommands,
    },
    /// Render a page view model
    View {
        /// dashboard, medications, appointments, records, consultations or providers
        kind: String,
        #[clap(long)]
        filter: Option<String>,
        #[clap(long, default_value = "")]
        search: String,
    },
}

#[derive(Subcommand, Debug)]
enum ReportCommands {
    List,
    /// Create a report, optionally with an attached file
    Upload {
        #[clap(long)]
        title: String,
        #[clap(long = "type")]
        report_type: String,
        #[clap(long)]
        date: String,
        #[clap(long)]
        provider: String,
        #[clap(long, default_value = "normal")]
        status: String,
        #[clap(long)]
        file: Option<PathBuf>,
    },
    /// Save the file of a report to `out`
    Download { id: String, out: PathBuf },
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum OrgCommands {
    Show,
    Save {
        #[clap(long)]
        name: String,
        #[clap(long)]
        address: Option<String>,
        #[clap(long)]
        phone: Option<String>,
        #[clap(long)]
        email: Option<String>,
        #[clap(long)]
        license: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    pretty_env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e.user_message());
        log::debug!("{:?}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = PortalConfig::from_env()?;
    let storage = Arc::new(FileStorage::new(&cli.state_dir));
    let portal = Portal::with_session_storage(config, storage)?;
    let mut toasts = portal.notifications().subscribe();

    let result = dispatch(&portal, cli.command).await;
    print_notifications(&mut toasts);
    result
}

async fn dispatch(portal: &Portal, command: Commands) -> Result<()> {
    let auth = portal.auth_service();

    if let Commands::Callback { url } = &command {
        return match auth.initialize(Some(url)).await {
            Some(outcome) => {
                println!("Navigate to {}", outcome.navigate_to);
                Ok(())
            }
            None => Err(Error::auth("No sign-in data in the callback URL")),
        };
    }
    auth.initialize(None).await;
    let snapshot = auth.settled().await;

    match command {
        Commands::Signup {
            email,
            password,
            name,
            user_type,
        } => {
            let form = SignUpForm {
                email,
                password,
                full_name: name,
                user_type,
            };
            let state = auth.sign_up_with_email(form).await?;
            print_snapshot(&state);
        }
        Commands::Login {
            email,
            password,
            from,
        } => {
            let state = auth.sign_in_with_email(&email, &password).await?;
            let target = portal.guard().post_login_target(from.as_deref(), &state);
            print_snapshot(&state);
            println!("Navigate to {}", target);
        }
        Commands::OauthUrl { provider, origin } => {
            println!("{}", auth.sign_in_with_oauth(provider, &origin)?);
        }
        Commands::Logout => {
            auth.sign_out().await;
        }
        Commands::Whoami => print_snapshot(&snapshot),
        Commands::Route { path } => match portal.guard().evaluate(&path, &snapshot) {
            GuardDecision::Loading => println!("loading"),
            GuardDecision::ConnectionError => println!("connection error"),
            GuardDecision::Allow(route) => println!("allow {}", route),
            GuardDecision::Redirect { to, from: Some(from) } => {
                println!("redirect {} (from {})", to, from)
            }
            GuardDecision::Redirect { to, from: None } => println!("redirect {}", to),
            GuardDecision::NotFound => println!("not found"),
        },
        Commands::Reports { command } => reports(portal, command).await?,
        Commands::Org { command } => org(portal, &snapshot, command).await?,
        Commands::View {
            kind,
            filter,
            search,
        } => view(portal, &snapshot, &kind, filter.as_deref(), &search).await?,
        Commands::Callback { .. } => unreachable!(),
    }
    Ok(())
}

async fn reports(portal: &Portal, command: ReportCommands) -> Result<()> {
    let service = portal.reports();
    match command {
        ReportCommands::List => {
            for report in service.list().await? {
                print_report(&report);
            }
        }
        ReportCommands::Upload {
            title,
            report_type,
            date,
            provider,
            status,
            file,
        } => {
            let status: ReportStatus = serde_json::from_value(serde_json::Value::String(status))?;
            let file = match file {
                Some(path) => {
                    let name = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("report")
                        .to_string();
                    Some(ReportFile::new(&name, tokio::fs::read(&path).await?))
                }
                None => None,
            };
            let report = NewReport {
                title,
                report_type,
                date,
                provider,
                status,
                user_id: None,
            };
            print_report(&service.create(report, file).await?);
        }
        ReportCommands::Download { id, out } => {
            let report = find_report(&service.list().await?, &id)?;
            let path = report
                .file_path
                .as_deref()
                .ok_or_else(|| Error::validation("Report has no attached file"))?;
            let bytes = service.download_file(path).await?;
            tokio::fs::write(&out, bytes).await?;
            println!("Saved {}", out.display());
        }
        ReportCommands::Delete { id } => {
            let report = find_report(&service.list().await?, &id)?;
            service.delete(&report).await?;
        }
    }
    Ok(())
}

fn find_report(reports: &[Report], id: &str) -> Result<Report> {
    reports
        .iter()
        .find(|r| r.id == id)
        .cloned()
        .ok_or_else(|| Error::validation(format!("No report with id {}", id)))
}

async fn org(portal: &Portal, snapshot: &AuthSnapshot, command: OrgCommands) -> Result<()> {
    let profile = snapshot.profile.as_ref().ok_or(Error::MissingSession)?;
    let service = portal.organizations();
    match command {
        OrgCommands::Show => match service.for_owner(&profile.id).await? {
            Some(org) => println!("{} ({}) verified={}", org.name, org.org_type, org.verified),
            None => println!("No organization profile yet"),
        },
        OrgCommands::Save {
            name,
            address,
            phone,
            email,
            license,
        } => {
            let existing = service.for_owner(&profile.id).await?;
            let draft = Organization {
                name,
                address,
                phone,
                email,
                license_number: license,
                ..existing.unwrap_or(Organization {
                    id: None,
                    owner_id: profile.id.clone(),
                    name: String::new(),
                    org_type: profile.user_type,
                    address: None,
                    phone: None,
                    email: None,
                    license_number: None,
                    verified: false,
                    created_at: None,
                    updated_at: None,
                })
            };
            let saved = service.save(draft, profile).await?;
            println!("Saved {}", saved.name);
        }
    }
    Ok(())
}

async fn view(
    portal: &Portal,
    snapshot: &AuthSnapshot,
    kind: &str,
    filter: Option<&str>,
    search: &str,
) -> Result<()> {
    let catalog = Catalog::bundled()?;
    let filter = filter.unwrap_or_default();
    match kind {
        "dashboard" if snapshot.effective_user_type().is_some_and(|t| t.is_professional()) => {
            let profile = snapshot.profile.as_ref();
            let org = match profile {
                Some(p) => portal.organizations().for_owner(&p.id).await?,
                None => None,
            };
            let dashboard = OrganizationDashboard::build(profile, org.as_ref());
            println!("{}\n{}", dashboard.title, dashboard.greeting);
            if dashboard.needs_setup {
                println!("Complete your profile at {}", dashboard.setup_route);
            }
        }
        "dashboard" => {
            let reports = match snapshot.is_authenticated() {
                true => portal.reports().list().await.ok().map(|r| r.len()),
                false => None,
            };
            let d = PatientDashboard::build(snapshot.profile.as_ref(), &catalog, reports);
            println!("{}", d.greeting);
            println!("Upcoming appointments: {}", d.upcoming_appointments);
            println!("Recent reports: {}", d.recent_reports);
            println!("Pending consultations: {}", d.pending_consultations);
            println!("Connected providers: {}", d.connected_providers);
        }
        "medications" => {
            for m in catalog.medications(parse_or_default(filter)?) {
                println!("{} {} {} ({:?})", m.name, m.dosage, m.frequency, m.status);
            }
        }
        "appointments" => {
            for a in catalog.appointments(parse_or_default(filter)?) {
                println!("{} {} {} {} ({:?})", a.date, a.time, a.doctor_name, a.location, a.status);
            }
        }
        "records" => {
            for r in catalog.records(parse_or_default(filter)?, search) {
                println!("{} {} [{}] {:?}", r.date, r.title, r.category, r.status);
            }
        }
        "consultations" => {
            for c in catalog.consultations(parse_or_default(filter)?) {
                println!("{} {} {} ({:?})", c.date, c.time, c.doctor_name, c.status);
            }
        }
        "providers" => {
            for p in catalog.providers(parse_or_default(filter)?, search) {
                println!("{} [{}] {} {:?}", p.name, p.provider_type, p.distance, p.status);
            }
        }
        other => return Err(Error::validation(format!("Unknown view: {}", other))),
    }
    Ok(())
}

fn parse_or_default<T>(value: &str) -> Result<T>
where
    T: std::str::FromStr<Err = Error> + Default,
{
    if value.is_empty() {
        Ok(T::default())
    } else {
        value.parse()
    }
}

fn print_snapshot(state: &AuthSnapshot) {
    println!("phase: {:?}", state.phase);
    match &state.user {
        Some(user) => println!("user: {} ({})", user.email.as_deref().unwrap_or("-"), user.id),
        None => println!("user: -"),
    }
    if let Some(profile) = &state.profile {
        println!("name: {}", profile.display_name());
    }
    if let Some(user_type) = state.effective_user_type() {
        println!("type: {} (home {})", user_type, user_type.home_path());
    }
    if let Some(error) = &state.network_error {
        println!("network error: {}", error);
    }
}

fn print_report(report: &Report) {
    println!(
        "{} {} [{}] {} {:?} {}",
        report.id,
        report.title,
        report.report_type,
        report.date,
        report.status,
        report.file_path.as_deref().unwrap_or("-")
    );
}

fn print_notifications(toasts: &mut broadcast::Receiver<Notification>) {
    while let Ok(toast) = toasts.try_recv() {
        println!("[{}] {}", toast.level, toast.message);
    }
}
