#[macro_use]
extern crate error_chain;
extern crate clap;
extern crate sandrun_core;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use error_chain::ChainedError;

use sandrun_core::classify::{classify, classify_failure, Verdict};
use sandrun_core::redirect::RedirectSpec;
use sandrun_core::{Identity, MemorySize, ProcessBuilder, ResourceLimits, ResultRecord};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Sandrun(sandrun_core::Error, sandrun_core::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
        Clap(::clap::Error);
        Xml(::quick_xml::Error);
    }
}

/// One process's worth of CLI configuration: everything `-t`/`-m`/`-i`/...
/// accumulate into before being turned into a `ProcessBuilder`. Both the
/// main program and `--interactor` parse into one of these, since the spec
/// gives the interactor "the same flag set".
struct ProcessConfig {
    program: Vec<String>,
    time_limit: Option<Duration>,
    hard_time_limit: Option<Duration>,
    memory_limit: Option<MemorySize>,
    cwd: Option<PathBuf>,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    join_stderr_to_stdout: bool,
    username: Option<String>,
    password: Option<String>,
    injections: Vec<PathBuf>,
    affinity_mask: Option<u64>,
    envs: Vec<(String, String)>,
    trusted: bool,
    no_idleness_check: bool,
    no_job: bool,
}

impl ProcessConfig {
    fn empty() -> ProcessConfig {
        ProcessConfig {
            program: Vec::new(),
            time_limit: None,
            hard_time_limit: None,
            memory_limit: None,
            cwd: None,
            stdin: None,
            stdout: None,
            stderr: None,
            join_stderr_to_stdout: false,
            username: None,
            password: None,
            injections: Vec::new(),
            affinity_mask: None,
            envs: Vec::new(),
            trusted: false,
            no_idleness_check: false,
            no_job: false,
        }
    }

    fn into_builder(self) -> Result<ProcessBuilder> {
        if self.program.is_empty() {
            bail!("no program given");
        }

        let mut builder = ProcessBuilder::new(self.program[0].clone());
        builder.args(self.program[1..].iter().cloned());

        for (name, value) in &self.envs {
            builder.env(name, value);
        }

        if let Some(dir) = self.cwd {
            builder.cwd(dir);
        }

        if let Some(path) = self.stdin {
            builder.stdin(RedirectSpec::File {
                path,
                mode: sandrun_core::FileMode::Read,
            });
        }
        if let Some(path) = self.stdout {
            builder.stdout(RedirectSpec::File {
                path,
                mode: sandrun_core::FileMode::Write,
            });
        }
        if let Some(path) = self.stderr {
            builder.stderr(RedirectSpec::File {
                path,
                mode: sandrun_core::FileMode::Write,
            });
        }
        builder.join_stderr_to_stdout(self.join_stderr_to_stdout);

        let mut limits = ResourceLimits::default();
        limits.time_limit = self.time_limit;
        limits.hard_time_limit = self.hard_time_limit;
        limits.memory_limit = self.memory_limit;
        limits.process_affinity_mask = self.affinity_mask;
        limits.check_idleness = !self.no_idleness_check;
        limits.restrict_ui = !self.trusted;
        limits.no_job = self.no_job;
        builder.limits(limits);

        if let Some(username) = self.username {
            builder.identity(Identity::Windows {
                username,
                password: self.password,
            });
        }

        for dll in self.injections {
            builder.inject(dll);
        }

        Ok(builder)
    }
}

fn parse_memory(s: &str) -> Result<MemorySize> {
    let (digits, unit) = s.split_at(s.len() - s.chars().last().map_or(0, |c| c.is_alphabetic() as usize));
    let value = u64::from_str(digits)
        .chain_err(|| format!("invalid memory value: {}", s))?;
    match unit.to_uppercase().as_str() {
        "" => Ok(MemorySize::Bytes(value)),
        "K" => Ok(MemorySize::KiloBytes(value)),
        "M" => Ok(MemorySize::MegaBytes(value)),
        other => bail!("unknown memory unit: {}", other),
    }
}

fn parse_duration(s: &str) -> Result<Duration> {
    if let Some(ms) = s.strip_suffix("ms") {
        let value = u64::from_str(ms).chain_err(|| format!("invalid duration value: {}", s))?;
        return Ok(Duration::from_millis(value));
    }
    if let Some(secs) = s.strip_suffix('s') {
        let value = u64::from_str(secs).chain_err(|| format!("invalid duration value: {}", s))?;
        return Ok(Duration::from_secs(value));
    }
    let value = u64::from_str(s).chain_err(|| format!("invalid duration value: {}", s))?;
    Ok(Duration::from_millis(value))
}

fn build_arg_spec<'a, 'b>() -> clap::App<'a, 'b> {
    clap::App::new("sandrun")
        .version("0.1")
        .about("Sandboxed subprocess execution engine for judging contest submissions")
        .help_short("?")
        .arg(clap::Arg::with_name("t").short("t").takes_value(true).help("soft CPU time limit, e.g. 500ms or 2s"))
        .arg(clap::Arg::with_name("h").short("h").takes_value(true).help("hard wall-time limit"))
        .arg(clap::Arg::with_name("m").short("m").takes_value(true).help("soft memory limit, e.g. 64M"))
        .arg(clap::Arg::with_name("d").short("d").takes_value(true).help("working directory"))
        .arg(clap::Arg::with_name("i").short("i").takes_value(true).help("stdin redirection file"))
        .arg(clap::Arg::with_name("o").short("o").takes_value(true).help("stdout redirection file"))
        .arg(clap::Arg::with_name("e").short("e").takes_value(true).help("stderr redirection file"))
        .arg(clap::Arg::with_name("u").short("u").help("join stderr into stdout"))
        .arg(clap::Arg::with_name("l").short("l").takes_value(true).help("login username (Windows)"))
        .arg(clap::Arg::with_name("p").short("p").takes_value(true).help("login password (Windows)"))
        .arg(clap::Arg::with_name("j").short("j").takes_value(true).multiple(true).number_of_values(1).help("DLL to inject (Windows)"))
        .arg(clap::Arg::with_name("a").short("a").takes_value(true).help("affinity mask"))
        .arg(clap::Arg::with_name("D").short("D").takes_value(true).multiple(true).number_of_values(1).help("env var K=V, repeatable"))
        .arg(clap::Arg::with_name("z").short("z").help("trusted mode, no UI restriction"))
        .arg(clap::Arg::with_name("no-idleness-check").long("no-idleness-check").help("disable idleness enforcement"))
        .arg(clap::Arg::with_name("no-job").long("no-job").help("disable job/cgroup enforcement"))
        .arg(clap::Arg::with_name("interactor").long("interactor").takes_value(true).help("second process, same flag set, quoted as one string"))
        .arg(clap::Arg::with_name("ri").long("ri").takes_value(true).help("record program input to file"))
        .arg(clap::Arg::with_name("ro").long("ro").takes_value(true).help("record program output to file"))
        .arg(clap::Arg::with_name("xml").long("xml").help("emit an XML result envelope"))
        .arg(clap::Arg::with_name("x").short("x").help("exit with the child's exit code"))
        .arg(clap::Arg::with_name("v").short("v").multiple(true).help("increase log verbosity"))
        .arg(clap::Arg::with_name("program").value_name("PROGRAM").multiple(true).required(true).help("program to run, with its arguments"))
}

fn parse_config(matches: &clap::ArgMatches, program: Vec<String>) -> Result<ProcessConfig> {
    let mut config = ProcessConfig::empty();
    config.program = program;

    if let Some(v) = matches.value_of("t") {
        config.time_limit = Some(parse_duration(v)?);
    }
    if let Some(v) = matches.value_of("h") {
        config.hard_time_limit = Some(parse_duration(v)?);
    }
    if let Some(v) = matches.value_of("m") {
        config.memory_limit = Some(parse_memory(v)?);
    }
    config.cwd = matches.value_of("d").map(PathBuf::from);
    config.stdin = matches.value_of("i").map(PathBuf::from);
    config.stdout = matches.value_of("o").map(PathBuf::from);
    config.stderr = matches.value_of("e").map(PathBuf::from);
    config.join_stderr_to_stdout = matches.is_present("u");
    config.username = matches.value_of("l").map(str::to_owned);
    config.password = matches.value_of("p").map(str::to_owned);
    if let Some(dlls) = matches.values_of("j") {
        config.injections = dlls.map(PathBuf::from).collect();
    }
    if let Some(mask) = matches.value_of("a") {
        config.affinity_mask = Some(
            u64::from_str(mask).chain_err(|| format!("invalid affinity mask: {}", mask))?,
        );
    }
    if let Some(envs) = matches.values_of("D") {
        for entry in envs {
            let pos = entry
                .find('=')
                .ok_or_else(|| Error::from(format!("invalid -D entry (expected K=V): {}", entry)))?;
            let (name, value) = entry.split_at(pos);
            config.envs.push((name.to_owned(), value[1..].to_owned()));
        }
    }
    config.trusted = matches.is_present("z");
    config.no_idleness_check = matches.is_present("no-idleness-check");
    config.no_job = matches.is_present("no-job");

    Ok(config)
}

fn render_xml(results: &[(&str, &sandrun_core::Result<ResultRecord>)]) -> Result<String> {
    use quick_xml::events::{BytesEnd, BytesStart, Event};
    use quick_xml::Writer;

    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Start(BytesStart::new("results")))?;

    for &(name, outcome) in results {
        let mut result_tag = BytesStart::new("result");
        result_tag.push_attribute(("process", name));
        writer.write_event(Event::Start(result_tag))?;

        match outcome {
            Ok(record) => {
                write_field(&mut writer, "time", &format!("{}", record.wall_time.as_millis()))?;
                write_field(&mut writer, "user-time", &format!("{}", record.user_time.as_millis()))?;
                write_field(&mut writer, "kernel-time", &format!("{}", record.kernel_time.as_millis()))?;
                write_field(&mut writer, "memory", &format!("{}", record.peak_memory.bytes()))?;
                write_field(&mut writer, "exit-code", &format!("{}", record.exit_code))?;
                write_field(&mut writer, "verdict", verdict_name(classify(record)))?;
                if let Some(output) = &record.output {
                    write_field(&mut writer, "output", &String::from_utf8_lossy(output))?;
                }
                if let Some(error) = &record.error {
                    write_field(&mut writer, "error", &String::from_utf8_lossy(error))?;
                }
            }
            Err(e) => {
                write_field(&mut writer, "verdict", verdict_name(classify_failure(e)))?;
                write_field(&mut writer, "error", &e.to_string())?;
            }
        }

        writer.write_event(Event::End(BytesEnd::new("result")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("results")))?;

    let bytes = writer.into_inner();
    Ok(String::from_utf8(bytes).expect("XML writer only emits UTF-8"))
}

fn write_field<W: std::io::Write>(
    writer: &mut quick_xml::Writer<W>,
    name: &str,
    value: &str,
) -> Result<()> {
    use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn verdict_name(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Ok => "OK",
        Verdict::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
        Verdict::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
        Verdict::IdlenessLimitExceeded => "IDLENESS_LIMIT_EXCEEDED",
        Verdict::SecurityViolation => "SECURITY_VIOLATION",
        Verdict::RuntimeError => "RUNTIME_ERROR",
        Verdict::Crash => "CRASH",
        Verdict::Fail => "FAIL",
    }
}

fn print_human(name: &str, outcome: &sandrun_core::Result<ResultRecord>) {
    match outcome {
        Ok(record) => {
            println!(
                "{}: verdict={} exit_code={} wall={}ms user={}ms memory={}B",
                name,
                verdict_name(classify(record)),
                record.exit_code,
                record.wall_time.as_millis(),
                record.user_time.as_millis(),
                record.peak_memory.bytes(),
            );
        }
        Err(e) => {
            println!("{}: verdict={} error={}", name, verdict_name(classify_failure(e)), e);
        }
    }
}

fn do_main() -> Result<i32> {
    let app = build_arg_spec();
    let matches = app.get_matches();

    stderrlog::new()
        .module(module_path!())
        .verbosity(matches.occurrences_of("v") as usize + 1)
        .init()
        .chain_err(|| "failed to initialize logging")?;

    let program: Vec<String> = matches
        .values_of("program")
        .unwrap()
        .map(str::to_owned)
        .collect();

    let config = parse_config(&matches, program)?;
    let builder = config.into_builder()?;
    let spec = builder.build()?;

    let interactor_spec = match matches.value_of("interactor") {
        Some(line) => {
            let interactor_argv = shell_split(line);
            let interactor_app = build_arg_spec();
            let interactor_matches = interactor_app
                .get_matches_from_safe(std::iter::once("sandrun".to_owned()).chain(interactor_argv))?;
            let interactor_program: Vec<String> = interactor_matches
                .values_of("program")
                .unwrap()
                .map(str::to_owned)
                .collect();
            let interactor_config = parse_config(&interactor_matches, interactor_program)?;
            Some(interactor_config.into_builder()?.build()?)
        }
        None => None,
    };

    let record_input = matches.value_of("ri").map(PathBuf::from);
    let record_output = matches.value_of("ro").map(PathBuf::from);

    let results: Vec<(&str, sandrun_core::Result<ResultRecord>)> = match interactor_spec {
        Some(interactor) => {
            let outcome =
                sandrun_core::interconnect::run(spec, interactor, record_input, record_output)
                    .map_err(Error::from)?;
            vec![("program", outcome.program), ("interactor", outcome.interactor)]
        }
        None => vec![("program", sandrun_core::runner::run(&spec))],
    };

    let exit_code = if matches.is_present("x") {
        results[0]
            .1
            .as_ref()
            .map(|r| r.exit_code as i32)
            .unwrap_or(1)
    } else {
        0
    };

    if matches.is_present("xml") {
        let refs: Vec<(&str, &sandrun_core::Result<ResultRecord>)> =
            results.iter().map(|(n, r)| (*n, r)).collect();
        println!("{}", render_xml(&refs)?);
    } else {
        for (name, outcome) in &results {
            print_human(name, outcome);
        }
    }

    Ok(exit_code)
}

/// Naive whitespace tokenizer for `--interactor "<args>"`. Good enough for
/// the contract the spec describes (a single pre-quoted string); callers
/// that need real shell quoting should prefer invoking sandrun twice.
fn shell_split(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_owned).collect()
}

fn main() {
    match do_main() {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("sandrun: {}", e.display_chain());
            std::process::exit(1);
        }
    }
}
