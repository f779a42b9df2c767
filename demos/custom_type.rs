use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{self, prelude::*};
use std::path;

use env_logger;
use log;
use serde;

use spillover::{by_fn, BatchingPolicy, ExternalSorterBuilder, Operations, Stream};

#[derive(Debug)]
struct CsvParseError(String);

impl Display for CsvParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "row format error: {}", self.0)
    }
}

impl Error for CsvParseError {}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Person {
    name: String,
    surname: String,
    age: u8,
}

impl Person {
    fn as_csv(&self) -> String {
        format!("{},{},{}", self.name, self.surname, self.age)
    }

    fn from_str(s: &str) -> Result<Self, CsvParseError> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return Err(CsvParseError("wrong columns number".to_string()));
        }

        Ok(Person {
            name: parts[0].to_string(),
            surname: parts[1].to_string(),
            age: parts[2]
                .parse()
                .map_err(|err| CsvParseError(format!("age field format error: {}", err)))?,
        })
    }
}

fn read_people(path: &str) -> Stream<Person> {
    let lines = io::BufReader::new(fs::File::open(path).unwrap()).lines();
    Stream::from_results(lines.map(|line| -> Result<Person, Box<dyn Error + Send + Sync>> {
        Ok(Person::from_str(&line?)?)
    }))
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Info).init();

    let sorter = ExternalSorterBuilder::new()
        .with_tmp_dir(path::Path::new("./"))
        .with_spill_threshold(10_000)
        .with_batching(BatchingPolicy::fixed(5_000))
        .build()
        .unwrap();
    let ops = Operations::<Person>::new(sorter);

    // people are the same person when their full names match
    let by_name = by_fn("person by surname, name", |a: &Person, b: &Person| {
        a.surname.cmp(&b.surname).then_with(|| a.name.cmp(&b.name))
    });

    let registered = read_people("registered.csv");
    let attended = read_people("attended.csv");
    let mut output_writer = io::BufWriter::new(fs::File::create("mismatched.csv").unwrap());

    // registered but absent, or attended without registration
    let mismatched = ops.difference(registered, attended, by_name).unwrap();

    for person in mismatched.map(Result::unwrap) {
        output_writer.write_all(format!("{}\n", person.as_csv()).as_bytes()).unwrap();
    }
    output_writer.flush().unwrap();
}
