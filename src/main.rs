use std::path::PathBuf;

use e6tui::app::RunOptions;

fn main() {
    let options = match handle_cli_flags() {
        Some(options) => options,
        None => return,
    };

    if let Err(err) = e6tui::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// Returns `None` when a flag was handled and the process should exit.
fn handle_cli_flags() -> Option<RunOptions> {
    let mut options = RunOptions::default();
    let mut saw_flag = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("e6tui {}", e6tui::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "e6tui: browse a tag-searchable image catalog from the terminal.\n\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message\n  --config <path>      Read configuration from <path>\n  --local              Run one session on this terminal instead of serving SSH"
                );
                saw_flag = true;
            }
            "--local" => options.local = true,
            "--config" => match args.next() {
                Some(path) => options.config_file = Some(PathBuf::from(path)),
                None => {
                    eprintln!("error: --config needs a path");
                    std::process::exit(2);
                }
            },
            _ => {}
        }
    }
    if saw_flag {
        None
    } else {
        Some(options)
    }
}
