#[cfg(test)]
mod tests {
    use crate::handlers::validate_name;
    use crate::license::{build_token, parse_day, parse_grant, parse_metadata};

    #[test]
    fn test_grant_strings() {
        assert_eq!(
            parse_grant("db.example.com/nodes=3").unwrap(),
            ("db.example.com/nodes".to_string(), 3)
        );
        assert_eq!(
            parse_grant("licensing.io/seats=10").unwrap(),
            ("licensing.io/seats".to_string(), 10)
        );

        for bad in [
            "db/nodes=3",
            "db.example.com/nodes",
            "db.example.com/nodes=-1",
            "-db.example.com/nodes=1",
            "db.example.com/no-des=1",
            "db.example.com/nodes=1 ",
        ] {
            assert!(parse_grant(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_metadata_pairs() {
        assert_eq!(
            parse_metadata("tier=gold").unwrap(),
            ("tier".to_string(), "gold".to_string())
        );
        assert_eq!(
            parse_metadata("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_metadata("=x").is_err());
        assert!(parse_metadata("novalue").is_err());
    }

    #[test]
    fn test_build_token() {
        let token = build_token(
            "tok-1".into(),
            "acme".into(),
            &["db.example.com/nodes=3".into(), "db.example.com/cores=16".into()],
            &["tier=gold".into()],
            parse_day("2026-01-01").unwrap(),
            parse_day("2027-01-01").unwrap(),
        )
        .unwrap();

        assert_eq!(token.amount_for("db.example.com", "nodes"), Some(3));
        assert_eq!(token.amount_for("db.example.com", "cores"), Some(16));
        assert_eq!(token.metadata["tier"], "gold");
        assert!(token.is_valid_at(parse_day("2026-12-31").unwrap()));
        assert!(!token.is_valid_at(parse_day("2027-01-01").unwrap()));
    }

    #[test]
    fn test_build_token_rejects_bad_input() {
        let day = |d| parse_day(d).unwrap();
        let grants = ["db.example.com/nodes=3".to_string()];

        assert!(build_token("t".into(), " ".into(), &grants, &[], day("2026-01-01"), day("2027-01-01")).is_err());
        assert!(build_token("t".into(), "acme".into(), &grants, &[], day("2027-01-01"), day("2026-01-01")).is_err());
        let twice = [grants[0].clone(), "db.example.com/nodes=5".to_string()];
        assert!(build_token("t".into(), "acme".into(), &twice, &[], day("2026-01-01"), day("2027-01-01")).is_err());
        assert!(parse_day("2026-13-01").is_err());
    }

    #[test]
    fn test_store_names() {
        assert!(validate_name("name", "db").is_ok());
        assert!(validate_name("name", "db.example.com").is_ok());
        assert!(validate_name("name", "").is_err());
        assert!(validate_name("name", "Upper").is_err());
        assert!(validate_name("name", "-lead").is_err());
        assert!(validate_name("name", &"a".repeat(64)).is_err());
    }
}
