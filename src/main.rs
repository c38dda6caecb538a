use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    charla::cli::main()
}
