use std::process;

pub fn print_usage() -> ! {
    println!("Usage: qsh [-hvp]");
    println!("   -h   Print this help message");
    println!("   -v   Enable verbose mode");
    println!("   -p   Do not print a command prompt");
    process::exit(1);
}

pub fn fatal(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    process::exit(1);
}
