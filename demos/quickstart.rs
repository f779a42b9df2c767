use std::fs;
use std::io::{self, prelude::*};
use std::path;

use env_logger;
use log;

use spillover::{ExternalSorterBuilder, Natural, Operations, Stream};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let sorter = ExternalSorterBuilder::new()
        .with_tmp_dir(path::Path::new("./"))
        .with_spill_threshold(100_000)
        .build()
        .unwrap();
    let ops = Operations::<String>::new(sorter);

    let first = Stream::from_results(io::BufReader::new(fs::File::open("first.txt").unwrap()).lines());
    let second = Stream::from_results(io::BufReader::new(fs::File::open("second.txt").unwrap()).lines());
    let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());

    let common = ops.intersection(first, second, Natural).unwrap();

    for item in common.map(Result::unwrap) {
        output_writer.write_all(format!("{}\n", item).as_bytes()).unwrap();
    }
    output_writer.flush().unwrap();
}
