pub fn tenant_key(prefix: &str, tenant_id: &str) -> String {
    format!("{}:{}", prefix, tenant_id)
}

pub fn tenant_ip_key(prefix: &str, tenant_id: &str, ip: &str) -> String {
    format!("{}:{}:{}", prefix, tenant_id, ip)
}
