//! Canopy CLI - menu-driven terminal for plot evaluation and dataset builds.

use std::io::{BufRead, Write};
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use chrono::Local;
use clap::Parser;

use canopy_utils::dates::parse_date;
use canopy_utils::{notification, properties};

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

static PANIC_REPORT: Mutex<Option<String>> = Mutex::new(None);

#[derive(Parser)]
#[command(name = "canopy-cli", version, about = "Forest plot monitoring toolkit")]
struct Cli {
    /// Port of the model service
    #[arg(long, default_value_t = 50051)]
    port: u16,
}

fn prompt(message: &str) -> String {
    print!("{BLUE}{message}{RESET}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    line.trim().to_string()
}

fn print_error(message: &str) {
    println!("\n{RED}{message}{RESET}");
}

async fn evaluate_plot_menu(port: u16) {
    println!("{YELLOW}\nWarning:{RESET}");
    println!("{YELLOW}- A '.geojson' file with the forest name should be present in data/geojsons.{RESET}");
    println!("{YELLOW}- The file should contain the desired plot identified by plot_id.\n{RESET}");

    let model_dir = properties::data_path("model");
    let model_files: Vec<String> = match std::fs::read_dir(&model_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(e) => {
            print_error(&format!("Error reading model folder: {e}"));
            return;
        }
    };
    if model_files.is_empty() {
        print_error("No models found in the model folder.");
        return;
    }

    println!("{GREEN}\nAvailable models:{RESET}");
    for (i, file) in model_files.iter().enumerate() {
        println!("{GREEN}{}. {file}{RESET}", i + 1);
    }

    let choice: usize = match prompt("Enter the number of the model you want to use: ").parse() {
        Ok(n) if n >= 1 && n <= model_files.len() => n,
        _ => {
            print_error("Invalid choice. Please select a valid model number.");
            return;
        }
    };
    let model = model_files[choice - 1].clone();
    println!("{GREEN}You selected the model: {model}{RESET}");

    let forest = prompt("Enter the forest name: ");
    let plot = prompt("Enter the plot id: ");
    let end_date = match parse_date(&prompt("Enter the date to be analyzed (YYYY-MM-DD): ")) {
        Ok(date) => date,
        Err(e) => {
            print_error(&format!("Invalid date: {e}"));
            return;
        }
    };

    match canopy_cmd::evaluate_plot(&model, &forest, &plot, end_date, port).await {
        Ok(results) => {
            println!(
                "\n{GREEN}Successful analysis! {} pixels classified.{RESET}",
                results.len()
            );
            let message = format!(
                "Canopy CLI\n\nSuccessful analysis of {forest}/{plot} at {end_date}: {} pixels classified.",
                results.len()
            );
            if let Err(e) = notification::send_success_notification(&message).await {
                print_error(&format!("Failed to send notification: {e}"));
            }
        }
        Err(e) => {
            print_error(&format!("Error evaluating plot: {e}"));
            let message = format!("Canopy CLI\n\nError evaluating plot: {e}");
            let _ = notification::send_error_notification(&message).await;
        }
    }
}

async fn create_dataset_menu(port: u16) {
    println!("{YELLOW}\nWarning:{RESET}");
    println!("{YELLOW}The resultant dataset will be created in the data/model folder.{RESET}");
    println!("{YELLOW}The input data should be a '.csv' file in the data/training_input folder.\n{RESET}");

    let input_name = prompt("Enter input data file name: ");
    let delta_days: i64 = match prompt("Enter the ideal delta days for the image analysis: ").parse()
    {
        Ok(n) => n,
        Err(_) => {
            print_error("Invalid number.");
            return;
        }
    };
    let delta_threshold: i64 =
        match prompt("Enter the delta days threshold for the image analysis: ").parse() {
            Ok(n) => n,
            Err(_) => {
                print_error("Invalid number.");
                return;
            }
        };
    let days_before: i64 =
        match prompt("Enter the days before the evidence to analyze: ").parse() {
            Ok(n) => n,
            Err(_) => {
                print_error("Invalid number.");
                return;
            }
        };

    let output_name = format!(
        "{}_{}_{delta_days}_{delta_threshold}.csv",
        input_name.trim_end_matches(".csv"),
        Local::now().format("%Y-%m-%d")
    );

    match canopy_cmd::create_dataset(
        &input_name,
        &output_name,
        delta_days,
        delta_threshold,
        days_before,
        port,
    )
    .await
    {
        Ok(()) => {
            println!("\n{GREEN}Dataset created successfully!{RESET}");
            let message =
                format!("Canopy CLI\n\nDataset created successfully!\n\nFile: {output_name}");
            let _ = notification::send_success_notification(&message).await;
        }
        Err(e) => {
            print_error(&format!("Error creating dataset: {e}"));
            if !e.to_string().contains("empty csv file given") {
                let message = format!("Canopy CLI\n\nError creating dataset: {e}");
                let _ = notification::send_error_notification(&message).await;
            }
        }
    }
}

fn list_forests_menu() {
    println!("{YELLOW}\nWarning:{RESET}");
    println!("{YELLOW}To add a new forest, add its '.geojson' file to the data/geojsons folder.{RESET}");
    match canopy_sentinel::geometry::list_forests() {
        Ok(forests) => {
            println!("\n{GREEN}Available forests:{RESET}");
            for forest in forests {
                println!("{GREEN}- {forest}{RESET}");
            }
        }
        Err(e) => print_error(&format!("Error reading geojsons folder: {e}")),
    }
}

fn list_plots_menu() {
    println!("{YELLOW}\nWarning:{RESET}");
    println!("{YELLOW}Plots are the features carrying a 'plot_id' property in the forest's '.geojson'.\n{RESET}");
    let forest = prompt("Enter the forest name: ");
    match canopy_sentinel::geometry::plot_ids(&forest) {
        Ok(plot_ids) if plot_ids.is_empty() => {
            print_error("No plot IDs found in the GeoJSON file.")
        }
        Ok(plot_ids) => {
            println!("{GREEN}\nAvailable plots:{RESET}");
            for plot_id in plot_ids {
                println!("{GREEN}- {plot_id}{RESET}");
            }
        }
        Err(e) => print_error(&format!("Error reading forest: {e}")),
    }
}

async fn run_menu(port: u16) {
    println!("{CYAN}======= CANOPY CLI ======={RESET}\n");
    loop {
        println!("{BLUE}==================={RESET}");
        println!("{BLUE}1. Evaluate a forest plot{RESET}");
        println!("{BLUE}2. Create a new dataset{RESET}");
        println!("{BLUE}3. List available forests{RESET}");
        println!("{BLUE}4. List available forest plots{RESET}");
        println!("{BLUE}5. Exit{RESET}");

        match prompt("Enter your choice: ").as_str() {
            "1" => evaluate_plot_menu(port).await,
            "2" => create_dataset_menu(port).await,
            "3" => list_forests_menu(),
            "4" => list_plots_menu(),
            "5" => {
                println!("Exiting...");
                return;
            }
            _ => println!("Invalid choice. Please try again."),
        }
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        let backtrace = std::backtrace::Backtrace::force_capture();
        let report = format!(
            "Canopy CLI panic:\n\n{panic_info}\n\nLocation: {location}\n\nStack trace:\n{backtrace}"
        );
        *PANIC_REPORT.lock().unwrap() = Some(report);
        default_hook(panic_info);
    }));
}

fn main() {
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path("../.env");
    }
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            print_error(&format!("Invalid arguments: {e}"));
            std::process::exit(1);
        }
        Err(e) => {
            // --help / --version
            let _ = e.print();
            return;
        }
    };
    println!("{GREEN}Using model service port: {}{RESET}", cli.port);

    install_panic_hook();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let runtime = tokio::runtime::Runtime::new().expect("failed to start async runtime");
        runtime.block_on(run_menu(cli.port));
    }));

    if outcome.is_err() {
        let report = PANIC_REPORT
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| "Canopy CLI panic: unknown cause".to_string());
        print_error(&report);
        print_error("Please check the input and try again.\nExiting...");

        if let Ok(runtime) = tokio::runtime::Runtime::new() {
            if let Err(e) = runtime.block_on(notification::send_error_notification(&report)) {
                print_error(&format!("Failed to send notification: {e}"));
            }
        }
        std::process::exit(1);
    }
}
