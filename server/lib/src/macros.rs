//! Construction macros for filters and entries, and the test harness macros
//! used by the plugin test suites.

/// Build a `Filter<FilterInvalid>` from filter components.
#[macro_export]
macro_rules! filter {
    ($fc:expr) => {
        $crate::filter::Filter::new($fc)
    };
}

/// Parse a DN literal. TEST ONLY - panics on invalid input.
#[cfg(test)]
macro_rules! dn {
    ($dn:expr) => {
        $crate::dn::Dn::parse($dn).expect("Invalid dn literal")
    };
}

/// Build an `Entry<EntryInit, EntryNew>` from a DN literal and avas.
/// TEST ONLY - panics on invalid input.
#[cfg(test)]
macro_rules! entry_init {
    ($dn:expr $(, ($attr:expr, $value:expr))* $(,)?) => {{
        #[allow(unused_mut)]
        let mut e = $crate::entry::Entry::new_init(
            $crate::dn::Dn::parse($dn).expect("Invalid dn literal"),
        );
        $( e.add_ava($attr, $value); )*
        e
    }};
}

#[cfg(test)]
macro_rules! run_create_test {
    (
        $expect:expr,
        $preload:expr,
        $create:expr,
        $plugins:expr,
        $check:expr
    ) => {{
        let server = $crate::testkit::setup_test_server($plugins);
        for e in $preload {
            server.internal_add(e).expect("Failed to preload entry");
        }

        let mut result: Result<(), $crate::proto::OperationError> = Ok(());
        for e in $create {
            let ce = $crate::event::AddEvent::new_internal(e);
            result = server.add(&ce);
            if result.is_err() {
                break;
            }
        }
        debug!(?result, "test result");
        assert_eq!(result, $expect);
        $check(&server);

        debug!("starting verification");
        let ver = server.verify();
        debug!(?ver, "verification");
        assert!(ver.is_empty());
        server.shutdown();
    }};
}

#[cfg(test)]
macro_rules! run_modify_test {
    (
        $expect:expr,
        $preload:expr,
        $target:expr,
        $modlist:expr,
        $plugins:expr,
        $check:expr
    ) => {{
        let server = $crate::testkit::setup_test_server($plugins);
        for e in $preload {
            server.internal_add(e).expect("Failed to preload entry");
        }

        let me = $crate::event::ModifyEvent::new_internal(dn!($target), $modlist);
        let result = server.modify(&me);
        debug!(?result, "test result");
        assert_eq!(result, $expect);
        $check(&server);

        debug!("starting verification");
        let ver = server.verify();
        debug!(?ver, "verification");
        assert!(ver.is_empty());
        server.shutdown();
    }};
}

#[cfg(test)]
macro_rules! run_delete_test {
    (
        $expect:expr,
        $preload:expr,
        $target:expr,
        $subtree:expr,
        $plugins:expr,
        $check:expr
    ) => {{
        let server = $crate::testkit::setup_test_server($plugins);
        for e in $preload {
            server.internal_add(e).expect("Failed to preload entry");
        }

        let de = $crate::event::DeleteEvent::new_internal(dn!($target), $subtree);
        let result = server.delete(&de);
        debug!(?result, "test result");
        assert_eq!(result, $expect);
        $check(&server);

        debug!("starting verification");
        let ver = server.verify();
        debug!(?ver, "verification");
        assert!(ver.is_empty());
        server.shutdown();
    }};
}

#[cfg(test)]
macro_rules! run_rename_test {
    (
        $expect:expr,
        $preload:expr,
        $target:expr,
        $new_rdn:expr,
        $delete_old_rdn:expr,
        $new_superior:expr,
        $plugins:expr,
        $check:expr
    ) => {{
        let server = $crate::testkit::setup_test_server($plugins);
        for e in $preload {
            server.internal_add(e).expect("Failed to preload entry");
        }

        let re = $crate::event::ModifyDnEvent::new_internal(
            dn!($target),
            $new_rdn,
            $delete_old_rdn,
            $new_superior,
        );
        let result = server.modify_dn(&re);
        debug!(?result, "test result");
        assert_eq!(result, $expect);
        $check(&server);

        debug!("starting verification");
        let ver = server.verify();
        debug!(?ver, "verification");
        assert!(ver.is_empty());
        server.shutdown();
    }};
}
