//! E2E tests for Broker and Client
use std::time::Duration;

use assert_matches::assert_matches;
use ipcbroker::{Args, Broker, CallError, Client, Config, Error};
use serde_json::json;
use tracing_test::traced_test;

fn config() -> Config {
    Config::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_idle_delay(Duration::from_millis(1))
}

fn broker() -> Broker {
    let mut broker = Broker::with_config(config());
    broker.start().expect("broker should start");
    broker
}

fn add(args: Args) -> Result<i64, CallError> {
    Ok(args.get::<i64>(0)? + args.get::<i64>(1)?)
}

fn sub(args: Args) -> Result<i64, CallError> {
    Ok(args.get::<i64>(0)? - args.get::<i64>(1)?)
}

fn sleepy(args: Args) -> Result<u64, CallError> {
    let millis = args.get::<u64>(0)?;
    std::thread::sleep(Duration::from_millis(millis));
    Ok(millis)
}

#[tokio::test]
async fn register_client() {
    let mut broker = broker();
    assert_eq!(broker.n_clients().await, 0);
    assert_eq!(broker.n_functions().await, 0);

    let mut ca = Client::new(&broker).await.unwrap();
    ca.start().unwrap();
    assert_eq!(broker.n_clients().await, 1);

    let mut cb = Client::new(&broker).await.unwrap();
    cb.start().unwrap();
    assert_eq!(broker.n_clients().await, 2);
    assert!(ca.is_running());
    assert!(cb.is_running());

    ca.register_function("add", add).await.unwrap();
    assert_eq!(broker.n_clients().await, 2);
    assert_eq!(broker.n_functions().await, 1);

    ca.stop().await.unwrap();
    cb.stop().await.unwrap();
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn register_function_twice() {
    let broker = broker();
    let ca = Client::new(&broker).await.unwrap();
    let cb = Client::new(&broker).await.unwrap();

    ca.register_function("add", add).await.unwrap();
    assert_matches!(
        cb.register_function("add", add).await,
        Err(Error::Call(CallError::FunctionAlreadyRegistered(name))) if name == "add"
    );
    assert_eq!(broker.n_functions().await, 1);
    assert!(!cb.is_local("add").await);
}

#[tokio::test]
async fn call_function_local() {
    let broker = broker();
    let mut ca = Client::new(&broker).await.unwrap();
    ca.start().unwrap();
    ca.register_function("add", add).await.unwrap();

    assert_eq!(
        ca.call("add", Args::positional([1, 2])).await.unwrap(),
        json!(3)
    );
    assert!(ca.is_running());
    ca.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn call_function_remote() {
    let broker = broker();
    let mut ca = Client::new(&broker).await.unwrap();
    let mut cb = Client::new(&broker).await.unwrap();
    ca.start().unwrap();
    cb.start().unwrap();

    ca.register_function("add", add).await.unwrap();
    cb.register_function("sub", sub).await.unwrap();

    assert_eq!(
        cb.call("add", Args::positional([1, 2])).await.unwrap(),
        json!(3)
    );
    assert_eq!(
        ca.call("sub", Args::positional([5, 2])).await.unwrap(),
        json!(3)
    );

    for (a, b) in [(4, 2), (-7, 3), (0, 0), (i64::MAX - 1, 1)] {
        assert_eq!(
            cb.call("add", Args::positional([a, b])).await.unwrap(),
            json!(add(Args::positional([a, b])).unwrap()),
            "remote call should match direct call"
        );
    }

    ca.stop().await.unwrap();
    cb.stop().await.unwrap();
}

#[tokio::test]
async fn call_with_kwargs() {
    let broker = broker();
    let mut ca = Client::new(&broker).await.unwrap();
    let cb = Client::new(&broker).await.unwrap();
    ca.start().unwrap();

    ca.register_function("scale", |args: Args| {
        let x = args.get::<f64>(0)?;
        let factor = args.kwarg::<f64>("factor")?.unwrap_or(1.0);
        Ok::<_, CallError>(x * factor)
    })
    .await
    .unwrap();

    assert_eq!(
        cb.call("scale", Args::positional([2.0])).await.unwrap(),
        json!(2.0)
    );
    assert_eq!(
        cb.call("scale", Args::positional([2.0]).with_kwarg("factor", 3.0))
            .await
            .unwrap(),
        json!(6.0)
    );
    ca.stop().await.unwrap();
}

#[tokio::test]
async fn call_unregistered() {
    let broker = broker();
    let ca = Client::new(&broker).await.unwrap();

    assert_matches!(
        ca.call("mul", Args::positional([1, 2])).await,
        Err(Error::Call(CallError::FunctionNotRegistered(name))) if name == "mul"
    );
}

#[tokio::test]
async fn callee_error_propagates() {
    let broker = broker();
    let mut ca = Client::new(&broker).await.unwrap();
    let cb = Client::new(&broker).await.unwrap();
    ca.start().unwrap();

    ca.register_function("div", |args: Args| {
        let (a, b) = (args.get::<i64>(0)?, args.get::<i64>(1)?);
        a.checked_div(b)
            .ok_or_else(|| CallError::failed("division by zero"))
    })
    .await
    .unwrap();

    assert_eq!(
        cb.call("div", Args::positional([6, 3])).await.unwrap(),
        json!(2)
    );
    assert_matches!(
        cb.call("div", Args::positional([6, 0])).await,
        Err(Error::Call(CallError::Failed(reason))) if reason == "division by zero"
    );
    assert_matches!(
        cb.call("div", Args::positional(["six", "three"])).await,
        Err(Error::Call(CallError::InvalidArguments(_)))
    );
    ca.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn long_running() {
    let mut broker = Broker::with_config(config().with_reply_timeout_factor(5));
    broker.start().unwrap();

    let mut ca = Client::new(&broker).await.unwrap();
    let cb = Client::new(&broker).await.unwrap();
    ca.start().unwrap();

    ca.register_long_running_function("sleep_long", sleepy)
        .await
        .unwrap();
    ca.register_function("sleep", sleepy).await.unwrap();

    assert_eq!(
        cb.call("sleep_long", Args::positional([200])).await.unwrap(),
        json!(200),
        "long running calls should outlast reply timeout"
    );
    assert_matches!(
        cb.call("sleep", Args::positional([200])).await,
        Err(Error::Call(CallError::NoResponse)),
        "other calls should time out"
    );

    // let the late reply drain before calling again
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        cb.call("sleep", Args::positional([0])).await.unwrap(),
        json!(0),
        "broker should keep routing after timeout"
    );

    ca.stop().await.unwrap();
    broker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_callers_share_callee() {
    let broker = broker();
    let mut callee = Client::new(&broker).await.unwrap();
    let ca = Client::new(&broker).await.unwrap();
    let cb = Client::new(&broker).await.unwrap();
    callee.start().unwrap();
    callee
        .register_function("echo", |args: Args| args.get::<serde_json::Value>(0))
        .await
        .unwrap();

    let calls_a = async {
        let mut results = vec![];
        for i in 0..10 {
            results.push(ca.call("echo", Args::positional([format!("a{i}")])).await);
        }
        results
    };
    let calls_b = async {
        let mut results = vec![];
        for i in 0..10 {
            results.push(cb.call("echo", Args::positional([format!("b{i}")])).await);
        }
        results
    };
    let (results_a, results_b) = tokio::join!(calls_a, calls_b);

    for (i, res) in results_a.into_iter().enumerate() {
        assert_eq!(res.unwrap(), json!(format!("a{i}")));
    }
    for (i, res) in results_b.into_iter().enumerate() {
        assert_eq!(res.unwrap(), json!(format!("b{i}")));
    }
    callee.stop().await.unwrap();
}

/// Client A serves `g` for C while its own call to `f` on B is outstanding
async fn serve_while_calling(long_running: bool) {
    let mut broker =
        Broker::with_config(config().with_reply_timeout_factor(50)).with_name("broker");
    broker.start().unwrap();

    let mut ca = Client::new(&broker).await.unwrap().with_name("ca");
    let mut cb = Client::new(&broker).await.unwrap().with_name("cb");
    let cc = Client::new(&broker).await.unwrap().with_name("cc");
    ca.start().unwrap();
    cb.start().unwrap();

    let g = |_: Args| {
        std::thread::sleep(Duration::from_millis(200));
        Ok::<_, CallError>("g")
    };
    if long_running {
        ca.register_long_running_function("g", g).await.unwrap();
    } else {
        ca.register_function("g", g).await.unwrap();
    }
    cb.register_function("f", |_| Ok::<_, CallError>("f"))
        .await
        .unwrap();

    let calls = async {
        tokio::join!(cc.call("g", Args::new()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ca.call("f", Args::new()).await
        })
    };
    let (g_result, f_result) = tokio::time::timeout(Duration::from_secs(3), calls)
        .await
        .expect("calls should complete");
    assert_eq!(g_result.unwrap(), json!("g"));
    assert_eq!(f_result.unwrap(), json!("f"));

    ca.stop().await.unwrap();
    cb.stop().await.unwrap();
    broker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn serve_while_calling_remote() {
    serve_while_calling(false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn serve_long_running_while_calling_remote() {
    serve_while_calling(true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn late_reply_not_delivered_to_next_caller() {
    let mut broker = Broker::with_config(config().with_reply_timeout_factor(5));
    broker.start().unwrap();

    let mut callee = Client::new(&broker).await.unwrap();
    let cb = Client::new(&broker).await.unwrap();
    let cc = Client::new(&broker).await.unwrap();
    callee.start().unwrap();

    callee
        .register_function("slow", |_| {
            std::thread::sleep(Duration::from_millis(150));
            Ok::<_, CallError>("late")
        })
        .await
        .unwrap();
    callee
        .register_long_running_function("echo", |args: Args| args.get::<serde_json::Value>(0))
        .await
        .unwrap();

    // `slow` times out at the broker. Its reply arrives while the broker waits on `echo` for C.
    let (slow_result, echo_result) = tokio::join!(cb.call("slow", Args::new()), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cc.call("echo", Args::positional(["c"])).await
    });
    assert_matches!(slow_result, Err(Error::Call(CallError::NoResponse)));
    assert_eq!(echo_result.unwrap(), json!("c"));

    assert_eq!(
        cb.call("echo", Args::positional(["b"])).await.unwrap(),
        json!("b"),
        "late reply should not be handed to later callers"
    );

    callee.stop().await.unwrap();
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn close_client() {
    let broker = broker();
    let mut ca = Client::new(&broker).await.unwrap();
    let cb = Client::new(&broker).await.unwrap();
    ca.start().unwrap();
    ca.register_function("add", add).await.unwrap();
    assert_eq!(broker.n_clients().await, 2);

    ca.close().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while broker.n_clients().await != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("broker should remove closed client");
    assert_eq!(
        broker.n_functions().await,
        1,
        "registrations of closed clients are not removed"
    );
    assert_matches!(
        cb.call("add", Args::positional([1, 2])).await,
        Err(Error::Call(CallError::NoResponse))
    );
}

#[tokio::test]
async fn start_stop_broker() {
    let mut broker = Broker::with_config(config());
    assert!(!broker.is_running());
    assert_matches!(broker.stop().await, Err(Error::NotRunning));

    broker.start().unwrap();
    assert_matches!(broker.start(), Err(Error::AlreadyRunning));
    assert!(broker.is_running());

    broker.stop().await.unwrap();
    assert_matches!(broker.stop().await, Err(Error::NotRunning));
    assert!(!broker.is_running());
}

#[tokio::test]
async fn start_stop_client() {
    let broker = broker();
    let mut ca = Client::new(&broker).await.unwrap();

    ca.start().unwrap();
    assert_matches!(ca.start(), Err(Error::AlreadyRunning));
    ca.stop().await.unwrap();
    assert_matches!(ca.stop().await, Err(Error::NotRunning));
}
