use clap::{Arg, Command};
use lockdownd::{LockdownClient, PreferenceStore, pretty_print_plist, provider::TcpProvider};

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("info")
        .about("Show properties of a device reachable over the network")
        .arg(
            Arg::new("host")
                .value_name("HOST")
                .help("IP address of the device")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("key")
                .long("key")
                .short('k')
                .value_name("KEY")
                .help("Read a single key instead of the whole dictionary"),
        )
        .arg(
            Arg::new("domain")
                .long("domain")
                .short('d')
                .value_name("DOMAIN")
                .help("Query this domain instead of the global one"),
        )
        .arg(
            Arg::new("prefs")
                .long("prefs")
                .value_name("DIR")
                .help("Preference store directory")
                .default_value(".lockdownd"),
        )
        .get_matches();

    let addr = matches
        .get_one::<String>("host")
        .unwrap()
        .parse()
        .expect("HOST is not a valid IP address");
    let store = PreferenceStore::new(matches.get_one::<String>("prefs").unwrap());
    let provider = TcpProvider::new(addr, "lockdownd-info");

    let mut client = LockdownClient::connect_with_handshake(&provider, &store)
        .await
        .expect("could not establish a trusted session");

    let domain = matches.get_one::<String>("domain").map(String::as_str);
    let key = matches.get_one::<String>("key").map(String::as_str);
    let value = client
        .get_value(domain, key)
        .await
        .expect("device refused the query");

    println!("{}", pretty_print_plist(&value));

    client.close().await;
}
