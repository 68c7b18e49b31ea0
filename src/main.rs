mod gateway;

use std::env;
use std::io::Write;
use std::sync::Arc;

use crate::gateway::{
    BackendKind, CancelToken, Gateway, Request, SandboxMode, StopReason,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

fn print_help() {
    println!("llmgate {} - gateway to interchangeable AI completion backends", VERSION);
    println!();
    println!("USAGE:");
    println!("    llmgate --prompt <TEXT> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help              Print help information");
    println!("    -v, --version           Print version information");
    println!("    --prompt <TEXT>         Prompt to submit (required)");
    println!("    --backend <cli|api>     Transport to use (default: cli)");
    println!("    --model <NAME>          Model to request (default: {})", DEFAULT_MODEL);
    println!("    --workspace <DIR>       Working directory for CLI backends");
    println!("    --resume <SESSION_ID>   Resume a previous session");
    println!("    --force                 Auto-approve backend tool actions");
    println!("    --sandbox <enabled|disabled>");
    println!("                            Sandbox mode for CLI backends");
    println!("    --no-stream             Wait for the full response instead of streaming");
    println!("    --json                  Print the full response as JSON (implies --no-stream output)");
}

fn print_version() {
    println!("llmgate {}", VERSION);
}

fn fail(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

fn parse_request(args: &[String]) -> (Request, bool) {
    let mut prompt: Option<String> = None;
    let mut backend = BackendKind::Cli;
    let mut model = DEFAULT_MODEL.to_string();
    let mut workspace: Option<String> = None;
    let mut resume: Option<String> = None;
    let mut force = false;
    let mut sandbox = SandboxMode::Disabled;
    let mut streaming = true;
    let mut json_output = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "--prompt" => match iter.next() {
                Some(v) => prompt = Some(v.clone()),
                None => fail("--prompt requires a value"),
            },
            "--backend" => match iter.next().and_then(|v| BackendKind::parse(v)) {
                Some(kind) => backend = kind,
                None => fail("--backend must be 'cli' or 'api'"),
            },
            "--model" => match iter.next() {
                Some(v) => model = v.clone(),
                None => fail("--model requires a value"),
            },
            "--workspace" => match iter.next() {
                Some(v) => workspace = Some(v.clone()),
                None => fail("--workspace requires a value"),
            },
            "--resume" => match iter.next() {
                Some(v) => resume = Some(v.clone()),
                None => fail("--resume requires a value"),
            },
            "--force" => force = true,
            "--sandbox" => match iter.next().and_then(|v| SandboxMode::parse(v)) {
                Some(mode) => sandbox = mode,
                None => fail("--sandbox must be 'enabled' or 'disabled'"),
            },
            "--no-stream" => streaming = false,
            "--json" => json_output = true,
            other => fail(&format!("unknown option: {}", other)),
        }
    }

    let Some(prompt) = prompt else {
        print_help();
        std::process::exit(1);
    };
    let mut req = Request::new(&prompt, backend, &model);
    if let Some(dir) = workspace {
        req.workspace_dir = dir;
    }
    req.resume_session_id = resume;
    req.force_approve = force;
    req.sandbox = sandbox;
    req.streaming = streaming;
    (req, json_output)
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_help();
        return;
    }
    let (req, json_output) = parse_request(&args);

    // Ctrl-C reaches the whole foreground process group, so the subprocess
    // dies with us and signal exits fold into cancellation on the way out.
    // The token stays available for embedding callers driving cancel().
    let gateway = Gateway::new();
    let cancel = Arc::new(CancelToken::new());

    let echo_chunks = req.streaming && !json_output;
    let mut on_chunk = |chunk: &str| {
        print!("{}", chunk);
        let _ = std::io::stdout().flush();
    };
    let callback: Option<&mut dyn FnMut(&str)> = if echo_chunks {
        Some(&mut on_chunk)
    } else {
        None
    };

    match gateway.submit(&req, Some(cancel), callback) {
        Ok(response) => {
            if json_output {
                match serde_json::to_string_pretty(&response) {
                    Ok(rendered) => println!("{}", rendered),
                    Err(e) => fail(&format!("could not serialize response: {}", e)),
                }
                return;
            }
            if echo_chunks {
                println!();
            } else {
                println!("{}", response.text);
            }
            match response.stop_reason {
                StopReason::Success => {}
                other => eprintln!("({})", other.as_str()),
            }
            if !response.substitutions.is_empty() {
                for (from, to) in &response.substitutions {
                    eprintln!("(model substituted: {} -> {})", from, to);
                }
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
