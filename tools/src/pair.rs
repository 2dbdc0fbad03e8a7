use clap::{Arg, Command};
use lockdownd::{LockdownClient, PreferenceStore, provider::TcpProvider};

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("pair")
        .about("Pair with a device reachable over the network")
        .arg(
            Arg::new("host")
                .value_name("HOST")
                .help("IP address of the device")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("prefs")
                .long("prefs")
                .value_name("DIR")
                .help("Preference store directory")
                .default_value(".lockdownd"),
        )
        .arg(
            Arg::new("unpair")
                .long("unpair")
                .help("Revoke the pairing instead of creating one")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let addr = matches
        .get_one::<String>("host")
        .unwrap()
        .parse()
        .expect("HOST is not a valid IP address");
    let store = PreferenceStore::new(matches.get_one::<String>("prefs").unwrap());
    let provider = TcpProvider::new(addr, "lockdownd-pair");

    let mut client = LockdownClient::connect(&provider)
        .await
        .expect("could not connect to lockdown");
    let udid = client.device_udid().await.expect("could not read UDID");
    let host_id = store.host_id().expect("could not load host identity");

    if matches.get_flag("unpair") {
        client
            .unpair(&store, Some(&host_id))
            .await
            .expect("unpair failed");
        println!("unpaired from {udid}");
    } else {
        client.pair(&store, Some(&host_id)).await.expect("pairing failed");
        client
            .validate_pair(&store, Some(&host_id))
            .await
            .expect("pair validation failed");

        // prove the pairing by opening a session with it
        let (session, ssl) = client
            .start_session(&store, &host_id)
            .await
            .expect("session failed");
        println!("paired with {udid}; session {session} (ssl: {ssl})");
    }

    client.close().await;
}
