fn main() {
    let code = match shuriken::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("shk: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}
