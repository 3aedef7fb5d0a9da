use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::str::FromStr;

use ustcp::{Config, Stack};

fn main() {
    env_logger::init();

    let stack = Stack::new(
        "tun1",
        Ipv4Addr::from_str("10.10.10.11").unwrap(),
        Ipv4Addr::from_str("255.255.255.0").unwrap(),
        Config::default(),
    )
    .unwrap();

    println!(">>> Trying to connect to server...");
    let mut stream = stack
        .connect("10.10.10.10".parse::<Ipv4Addr>().unwrap(), 9090)
        .unwrap();
    println!(">>> Connected!");

    loop {
        let mut buf = [0u8; 1500];
        let n = stream.read(&mut buf[..]).unwrap();

        if n == 0 {
            break;
        }

        stream.write_all(&buf[..n]).unwrap();

        println!(
            "\n>>> Read: {:?}\n",
            String::from_iter(buf[..n].iter().map(|c| *c as char))
        );
    }

    drop(stream);

    stack.join();
}
