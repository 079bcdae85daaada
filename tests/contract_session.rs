//! Tests for the contract signing session endpoints.

mod common;

use carenet_auth::contract::{Language, Type, Version};
use carenet_auth::core::PartyId;
use carenet_auth::endpoint::{Config, CreateSessionRequest, Service, ValidationRequest};
use carenet_auth::error::Error;
use carenet_auth::session::SessionStatus;
use carenet_auth::validator::{ContractFormat, ValidationState};
use base64ct::{Base64, Encoding};
use chrono::TimeDelta;
use common::{MapCrlFetcher, TestProvider};

const CARE_ORG: &str = "urn:oid:2.16.840.1.113883.2.4.6.1:00000000";
const CARE_ORG_NAME: &str = "verpleeghuis De nootjes";
const VENDOR: &str = "urn:oid:1.3.6.1.4.1.54851.4:00000001";

fn config() -> Config {
    Config {
        public_url: common::PUBLIC_URL.to_string(),
        mode: "server".to_string(),
        acting_party_cn: Some("Demo EHR".to_string()),
        contract_validators: vec!["abc".to_string()],
        vendor: VENDOR.to_string(),
        ..Config::default()
    }
}

async fn service_with_care_org() -> (Service<TestProvider, MapCrlFetcher>, TestProvider) {
    common::init_tracer();
    let provider = TestProvider::new();
    let care_org = PartyId::parse(CARE_ORG).unwrap();
    let vendor = PartyId::parse(VENDOR).unwrap();
    provider.register_organization_with_key(&care_org, CARE_ORG_NAME, &vendor);

    let service = Service::new(config(), provider.clone(), MapCrlFetcher::new(), None)
        .await
        .expect("service wires");
    (service, provider)
}

fn session_request() -> CreateSessionRequest {
    CreateSessionRequest {
        type_: Type("BehandelaarLogin".to_string()),
        language: Some(Language("NL".to_string())),
        version: Some(Version("v1".to_string())),
        legal_entity: CARE_ORG.to_string(),
        valid_from: Some("2020-03-26T00:00:00+01:00".to_string()),
        valid_to: Some("2020-03-26T13:00:00+01:00".to_string()),
        ..CreateSessionRequest::default()
    }
}

#[tokio::test]
async fn happy_signing_session() {
    let (service, provider) = service_with_care_org().await;

    let created = service.create_signing_session(session_request()).await.expect("session starts");
    assert!(created.qr_code_info.u.contains("/auth/abcclient/"));
    assert!(!created.session_id.is_empty());

    // not signed yet
    let status = service
        .contract_session_status(&created.session_id)
        .await
        .expect("session is known");
    assert_eq!(status.status, SessionStatus::Pending);
    assert!(status.nuts_auth_token.is_none());

    // the user signs
    provider.complete_signing_session(&created.session_id, common::standard_disclosed());

    let status = service
        .contract_session_status(&created.session_id)
        .await
        .expect("session is known");
    assert_eq!(status.status, SessionStatus::Done);

    let disclosed = status.disclosed.expect("attributes disclosed");
    assert_eq!(disclosed["gemeente.personalData.firstnames"], "Jan");

    // the identity token is a compact JWS signed by the care organization
    let token = status.nuts_auth_token.expect("token minted");
    assert_eq!(token.split('.').count(), 3);
    assert!(token.starts_with("ey"));
}

#[tokio::test]
async fn cancelled_session_has_no_token() {
    let (service, provider) = service_with_care_org().await;

    let created = service.create_signing_session(session_request()).await.expect("session starts");
    provider.cancel_signing_session(&created.session_id);

    let status = service
        .contract_session_status(&created.session_id)
        .await
        .expect("session is known");
    assert_eq!(status.status, SessionStatus::Cancelled);
    assert!(status.nuts_auth_token.is_none());
}

#[tokio::test]
async fn session_times_out() {
    let (service, provider) = service_with_care_org().await;

    let created = service.create_signing_session(session_request()).await.expect("session starts");

    provider.set_now(common::frozen_now() + TimeDelta::try_minutes(6).unwrap());
    let status = service
        .contract_session_status(&created.session_id)
        .await
        .expect("session is known");
    assert_eq!(status.status, SessionStatus::Timeout);
}

#[tokio::test]
async fn unknown_contract_type_is_rejected() {
    let (service, _provider) = service_with_care_org().await;

    let mut request = session_request();
    request.type_ = Type("UnknownContract".to_string());

    let err = service.create_signing_session(request).await.unwrap_err();
    assert!(matches!(err, Error::ContractNotFound(_)));
    assert!(err.to_string().contains("Could not find contract with type Unknown"));
}

#[tokio::test]
async fn malformed_valid_from_is_rejected() {
    let (service, _provider) = service_with_care_org().await;

    let mut request = session_request();
    request.valid_from = Some("not-a-time".to_string());

    let err = service.create_signing_session(request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(err.to_string().contains("Could not parse validFrom"));
    assert_eq!(err.status(), 400);
}

#[tokio::test]
async fn unknown_legal_entity_is_rejected() {
    let (service, _provider) = service_with_care_org().await;

    let mut request = session_request();
    request.legal_entity = "urn:oid:2.16.840.1.113883.2.4.6.1:99999999".to_string();

    let err = service.create_signing_session(request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (service, _provider) = service_with_care_org().await;

    let err = service.contract_session_status("no-such-session").await.unwrap_err();
    assert!(matches!(err, Error::SessionNotFound));
    assert_eq!(err.status(), 404);
}

#[tokio::test]
async fn validate_contract_accepts_valid_abc_signature() {
    let (service, _provider) = service_with_care_org().await;

    let message = common::contract_text_for("Demo EHR", CARE_ORG_NAME);
    let signature = TestProvider::signed_contract(&message, common::standard_disclosed());
    let raw = Base64::encode_string(&serde_json::to_vec(&signature).unwrap());

    let result = service
        .validate_contract(ValidationRequest {
            contract_format: ContractFormat::Abc,
            contract_string: raw,
            acting_party_cn: Some("Demo EHR".to_string()),
        })
        .await
        .expect("validates");

    assert_eq!(result.validation_result, ValidationState::Valid);
    assert_eq!(result.contract_format, ContractFormat::Abc);
    assert_eq!(result.disclosed_attributes["gemeente.personalData.firstnames"], "Jan");
}

#[tokio::test]
async fn validate_contract_flags_acting_party_mismatch_invalid() {
    let (service, _provider) = service_with_care_org().await;

    let message = common::contract_text_for("Demo EHR", CARE_ORG_NAME);
    let signature = TestProvider::signed_contract(&message, common::standard_disclosed());
    let raw = Base64::encode_string(&serde_json::to_vec(&signature).unwrap());

    let result = service
        .validate_contract(ValidationRequest {
            contract_format: ContractFormat::Abc,
            contract_string: raw,
            acting_party_cn: Some("Mallory EHR".to_string()),
        })
        .await
        .expect("validation ran");

    assert_eq!(result.validation_result, ValidationState::Invalid);
    insta::assert_json_snapshot!(result, @r###"
    {
      "validation_result": "INVALID",
      "contract_format": "abc",
      "disclosed_attributes": {}
    }
    "###);
}

#[tokio::test]
async fn validate_contract_rejects_undecodable_input() {
    let (service, _provider) = service_with_care_org().await;

    let err = service
        .validate_contract(ValidationRequest {
            contract_format: ContractFormat::Abc,
            contract_string: "%%% not base64 %%%".to_string(),
            acting_party_cn: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn contract_template_is_served_with_defaults() {
    let (service, _provider) = service_with_care_org().await;

    let response = service
        .contract_by_type(&Type("BehandelaarLogin".to_string()), None, None)
        .expect("template exists");
    assert_eq!(response.language, Language("NL".to_string()));
    assert_eq!(response.version, Version("v1".to_string()));
    assert!(response.template.contains("{{acting_party}}"));

    let err = service
        .contract_by_type(&Type("UnknownContract".to_string()), None, None)
        .unwrap_err();
    assert!(matches!(err, Error::ContractNotFound(_)));
    assert_eq!(err.status(), 404);
}

#[tokio::test]
async fn draw_up_contract_renders_organization_name() {
    let (service, _provider) = service_with_care_org().await;

    let response = service
        .draw_up_contract(carenet_auth::endpoint::DrawUpContractRequest {
            type_: Type("BehandelaarLogin".to_string()),
            language: None,
            version: None,
            legal_entity: CARE_ORG.to_string(),
            valid_from: Some("2020-10-29T01:30:00+01:00".to_string()),
            valid_to: Some("2020-10-29T02:30:00+01:00".to_string()),
        })
        .await
        .expect("draws up");

    assert!(response.message.contains(CARE_ORG_NAME));
    assert!(response.message.contains("Demo EHR"));
    assert!(response.message.contains("donderdag, 29 oktober 2020"));
}
