// LatticeDB CLI
//
// Reads SQL statements from stdin until EOF or `EXIT;`, writes tabular
// results to stdout. Exit code 0 on clean termination, non-zero when the
// engine cannot be opened or enters an unrecoverable state.

use latticedb::execution::executor::{QueryResult, Session};
use latticedb::parser::{self, ast::Statement};
use latticedb::{Config, Engine, VERSION};
use std::io::{self, BufRead, Write};

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    let engine = match Engine::open(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("latticedb {}: cannot open database: {}", VERSION, e);
            std::process::exit(1);
        }
    };

    let mut session = Session::default();
    let stdin = io::stdin();
    let mut buffer = String::new();
    let mut exit_code = 0;

    'outer: for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                eprintln!("stdin error: {}", e);
                exit_code = 1;
                break;
            }
        };
        buffer.push_str(&line);
        buffer.push('\n');
        if !line.trim_end().ends_with(';') {
            continue;
        }

        let statements = match parser::parse(&buffer) {
            Ok(statements) => statements,
            Err(e) => {
                println!("ERROR {}: {}", e.sqlstate(), e);
                buffer.clear();
                continue;
            }
        };
        buffer.clear();

        for stmt in &statements {
            if matches!(stmt, Statement::Exit) {
                break 'outer;
            }
            match engine.execute_parsed(stmt, &mut session) {
                Ok(result) => print_result(&result),
                Err(e) => {
                    println!("ERROR {}: {}", e.sqlstate(), e);
                    if engine.is_panicked() {
                        eprintln!("engine entered panic mode; refusing further writes");
                        exit_code = 1;
                        break 'outer;
                    }
                }
            }
        }
    }

    if let Err(e) = engine.close() {
        eprintln!("shutdown checkpoint failed: {}", e);
        exit_code = 1;
    }
    let _ = io::stdout().flush();
    std::process::exit(exit_code);
}

fn print_result(result: &QueryResult) {
    if result.headers.is_empty() {
        if !result.message.is_empty() {
            println!("{}", result.message);
        }
        return;
    }
    println!("{}", result.headers.join("\t"));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join("\t"));
    }
    println!("{}", result.message);
}
