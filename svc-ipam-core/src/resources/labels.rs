use std::collections::BTreeMap;

pub fn get_pool_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), "svc-ipam".to_owned()),
        ("app.kubernetes.io/component".to_owned(), "address-pool".to_owned()),
        ("app.kubernetes.io/managed-by".to_owned(), "svc-ipam-agent".to_owned()),
    ])
}
