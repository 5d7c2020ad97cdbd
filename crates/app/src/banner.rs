const WIDTH: usize = 60;

pub fn print() {
    let line = "=".repeat(WIDTH);
    println!("{}", line);
    println!("{:^width$}", "HUBCHAT - PEER-TO-PEER CHAT", width = WIDTH);
    println!("{}", line);
    println!();
}

/// Boxed block of lines shown once a session is up
pub fn print_section(title: &str, lines: &[String]) {
    let line = "=".repeat(WIDTH);
    println!();
    println!("{}", line);
    println!("{}", title);
    for text in lines {
        println!("{}", text);
    }
    println!("{}", line);
}
