use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use lipidchart_core::{compose, AssayCategory, ChartConfig, ChartError, Disorder};
use lipidchart_fhir::RecordStore;

#[derive(Parser)]
#[command(
    name = "lipidchart",
    about = "Query a patient record collection and compose chart views."
)]
struct Cli {
    /// Path to the JSON record collection.
    #[arg(short, long)]
    data: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the patients diagnosed with a disorder.
    Cohort {
        #[arg(long, value_enum, default_value_t = DisorderArg::Hyperlipidemia)]
        disorder: DisorderArg,
    },
    /// Print the flat lab and medication report for one patient.
    Report {
        #[arg(long)]
        patient: String,
    },
    /// Compose the chart view for one patient.
    Chart {
        #[arg(long)]
        patient: String,
        /// Resample series through a quadratic spline.
        #[arg(long)]
        smooth: bool,
        /// Attach unit text to each plotted point.
        #[arg(long)]
        show_units: bool,
        /// Skip the age-adjusted cholesterol reference bands.
        #[arg(long)]
        no_bands: bool,
        /// Window start (YYYY-MM-DD).
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Window end (YYYY-MM-DD).
        #[arg(long)]
        end: Option<NaiveDate>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DisorderArg {
    Hyperlipidemia,
    Diabetes,
}

impl From<DisorderArg> for Disorder {
    fn from(disorder: DisorderArg) -> Self {
        match disorder {
            DisorderArg::Hyperlipidemia => Disorder::Hyperlipidemia,
            DisorderArg::Diabetes => Disorder::Diabetes,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let data = std::fs::read_to_string(&cli.data)
        .with_context(|| format!("failed to read {}", cli.data.display()))?;
    let store = RecordStore::load_str(&data)?;

    match cli.command {
        Commands::Cohort { disorder } => {
            let roster = store.cohort_roster(disorder.into());
            println!("{}", serde_json::to_string_pretty(&roster)?);
        }
        Commands::Report { patient } => match store.patient_report(&patient) {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(err @ (ChartError::PatientNotFound(_) | ChartError::NotInCohort(_))) => {
                eprintln!("{err}");
                return Ok(ExitCode::from(2));
            }
            Err(err) => return Err(err.into()),
        },
        Commands::Chart {
            patient,
            smooth,
            show_units,
            no_bands,
            start,
            end,
        } => {
            if !store.contains_patient(&patient) {
                eprintln!("patient {patient} not found");
                return Ok(ExitCode::from(2));
            }

            let mut measurements = store.measurements(&patient, AssayCategory::Glucose)?;
            measurements.extend(store.measurements(&patient, AssayCategory::Cholesterol)?);
            let medications = store.medications(&patient, Disorder::Hyperlipidemia)?;

            let bands = if no_bands {
                None
            } else {
                match store.reference_bands(&patient, Disorder::Hyperlipidemia) {
                    Ok(bands) => bands,
                    Err(ChartError::BirthDateUnavailable(_)) => {
                        eprintln!("no usable birth date, skipping reference bands");
                        None
                    }
                    Err(err) => return Err(err.into()),
                }
            };

            let window = match (start, end) {
                (Some(start), Some(end)) => Some((day_start(start), day_start(end))),
                _ => None,
            };
            let config = ChartConfig {
                smooth,
                show_units,
                window,
            };

            match compose(&measurements, &medications, bands.as_ref(), &config) {
                Ok(view) => println!("{}", serde_json::to_string_pretty(&view)?),
                Err(ChartError::NoPlottableData) => {
                    eprintln!("no plottable data for patient {patient}");
                    return Ok(ExitCode::from(3));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}
