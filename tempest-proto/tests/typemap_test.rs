use tempest_proto::{Error, TypeMap};

#[test]
fn intern_assigns_sequential_ids() {
    let mut map = TypeMap::new();
    assert_eq!(map.intern("Alpha").unwrap(), 0);
    assert_eq!(map.intern("Beta").unwrap(), 1);
    assert_eq!(map.intern("Alpha").unwrap(), 0);
    assert_eq!(map.len(), 2);
}

#[test]
fn drain_new_flushes_once() {
    let mut map = TypeMap::new();
    map.intern("Alpha").unwrap();
    map.intern("Beta").unwrap();

    let fresh = map.drain_new();
    assert_eq!(
        fresh,
        vec![("Alpha".to_owned(), 0), ("Beta".to_owned(), 1)]
    );
    // Already flushed; nothing new until another intern.
    assert!(map.drain_new().is_empty());

    map.intern("Alpha").unwrap();
    assert!(map.drain_new().is_empty());
    map.intern("Gamma").unwrap();
    assert_eq!(map.drain_new(), vec![("Gamma".to_owned(), 2)]);
}

#[test]
fn bind_reconstructs_reader_side() {
    let mut map = TypeMap::new();
    map.bind(0, "Alpha".to_owned()).unwrap();
    map.bind(1, "Beta".to_owned()).unwrap();
    assert_eq!(map.get(0), Some("Alpha"));
    assert_eq!(map.get(1), Some("Beta"));
    assert_eq!(map.get(2), None);
}

#[test]
fn bind_rejects_gaps() {
    let mut map = TypeMap::new();
    map.bind(0, "Alpha".to_owned()).unwrap();
    assert!(matches!(
        map.bind(5, "Echo".to_owned()),
        Err(Error::NonContiguousTypeId(5))
    ));
}

#[test]
fn bound_names_resolve_through_intern() {
    let mut map = TypeMap::new();
    map.bind(0, "Alpha".to_owned()).unwrap();
    // Interning a name absorbed from a header reuses its id and is not
    // treated as new.
    assert_eq!(map.intern("Alpha").unwrap(), 0);
    assert!(map.drain_new().is_empty());
}
