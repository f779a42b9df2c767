use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use spillover::{Comparer, ExternalSorterBuilder, Natural, Operations, Reverse, Stream};

fn main() {
    let arg_parser = build_arg_parser();
    let (command, args) = match arg_parser.subcommand() {
        Some(subcommand) => subcommand,
        None => {
            eprintln!("subcommand is required");
            process::exit(2);
        }
    };

    let log_level: LogLevel = args.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let order: Order = args.value_of_t_or_exit("sort");
    let tmp_dir: Option<&str> = args.value_of("tmp_dir");
    let threshold: Option<usize> = args
        .is_present("threshold")
        .then(|| args.value_of_t_or_exit("threshold"));
    let rw_buf_size: Option<&str> = args.value_of("rw_buf_size");

    let mut sorter_builder = ExternalSorterBuilder::new();
    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }
    if let Some(threshold) = threshold {
        sorter_builder = sorter_builder.with_spill_threshold(threshold);
    }
    if let Some(rw_buf_size) = rw_buf_size {
        sorter_builder = sorter_builder.with_rw_buf_size(
            rw_buf_size.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize,
        );
    }

    let ops = match sorter_builder.build() {
        Ok(sorter) => Operations::<String>::new(sorter),
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let output = match args.value_of("output") {
        Some(output) => output,
        None => {
            log::error!("output file is required");
            process::exit(2);
        }
    };
    let mut output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };

    let result = match order {
        Order::Asc => run(&ops, command, args, Natural),
        Order::Desc => run(&ops, command, args, Reverse(Natural)),
    };
    let result_stream = match result {
        Ok(result_stream) => result_stream,
        Err(err) => {
            log::error!("{} error: {}", command, err);
            process::exit(1);
        }
    };

    let mut written = 0;
    for line in result_stream {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::error!("result stream error: {}", err);
                process::exit(1);
            }
        };
        if let Err(err) = output_stream.write_all(format!("{}\n", line).as_bytes()) {
            log::error!("data saving error: {}", err);
            process::exit(1);
        };
        written += 1;
    }

    if let Err(err) = output_stream.flush() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }
    log::info!("{} lines written to {}", written, output);
}

fn run<C: Comparer<String>>(
    ops: &Operations<String>,
    command: &str,
    args: &clap::ArgMatches,
    comparer: C,
) -> spillover::Result<Stream<String>> {
    let first = open_input(args.value_of("input").expect("value is required"));
    if command == "sort" {
        return ops.sort(first, comparer);
    }

    let second = open_input(args.value_of("other").expect("value is required"));
    match command {
        "difference" => ops.difference(first, second, comparer),
        "intersection" => ops.intersection(first, second, comparer),
        "diff-intersect" => ops.difference_with_intersection(first, second, comparer),
        _ => unreachable!("unknown subcommand {}", command),
    }
}

fn open_input(input: &str) -> Stream<String> {
    match fs::File::open(input) {
        Ok(file) => Stream::from_results(io::BufReader::new(file).lines()),
        Err(err) => {
            log::error!("input file {} opening error: {}", input, err);
            process::exit(1);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

fn input_arg() -> clap::Arg<'static> {
    clap::Arg::new("input")
        .help("input file, one item per line")
        .required(true)
        .index(1)
}

fn other_arg() -> clap::Arg<'static> {
    clap::Arg::new("other")
        .help("second input file, one item per line")
        .required(true)
        .index(2)
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("spillover")
        .about("external sort and sorted set operations over line files")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .subcommand(clap::App::new("sort").about("sorts the lines of a file").arg(input_arg()))
        .subcommand(
            clap::App::new("difference")
                .about("lines held by exactly one of the files")
                .arg(input_arg())
                .arg(other_arg()),
        )
        .subcommand(
            clap::App::new("intersection")
                .about("lines held by both files")
                .arg(input_arg())
                .arg(other_arg()),
        )
        .subcommand(
            clap::App::new("diff-intersect")
                .about("difference of the files followed by their intersection")
                .arg(input_arg())
                .arg(other_arg()),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .takes_value(true)
                .global(true),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(Order::possible_values())
                .global(true),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values())
                .global(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true)
                .global(true),
        )
        .arg(
            clap::Arg::new("threshold")
                .short('t')
                .long("threshold")
                .help("number of items kept in memory before spilling to disk")
                .takes_value(true)
                .global(true)
                .validator(|v| match v.parse::<usize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Threshold format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("rw_buf_size")
                .short('b')
                .long("rw-buf-size")
                .help("temporary file read/write buffer size")
                .takes_value(true)
                .global(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Buffer size format incorrect: {}", err)),
                }),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
