// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sensor queries and their mapping to the sensor request selector.

use crate::control::AmcError;
use amc_spec::SensorApi;
use amc_spec::SensorRepo;
use amc_spec::SensorSelector;

/// Sensor id that selects every sensor in a repository.
const ALL_SENSOR_ID: u8 = 0;
const TOTAL_POWER_SENSOR_ID: u8 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TemperatureSensor {
    Inlet = 1,
    Outlet = 2,
    Board = 3,
    Fpga = 4,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum VoltageSensor {
    Pex12V = 1,
    Vcc1V2 = 2,
    Vccint = 3,
    Aux12V = 4,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CurrentSensor {
    Vccint = 1,
    Vcc1V2 = 2,
    Pex12V = 3,
}

/// A sensor read request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SensorQuery {
    Temperature(TemperatureSensor),
    Voltage(VoltageSensor),
    Current(CurrentSensor),
    TotalPower,
    /// Every instance in a temperature, voltage, current or power
    /// repository.
    AllInstances(SensorRepo),
    /// The full sensor data record of a repository.
    Sdr(SensorRepo),
    /// The size of a repository's sensor data record.
    SdrSize(SensorRepo),
}

impl SensorQuery {
    /// Builds the selector word for the request.
    pub fn selector(&self) -> Result<SensorSelector, AmcError> {
        let (repo, api, sensor_id) = match *self {
            Self::Temperature(sensor) => (
                SensorRepo::TEMPERATURE,
                SensorApi::GET_SINGLE_SDR,
                sensor as u8,
            ),
            Self::Voltage(sensor) => (SensorRepo::VOLTAGE, SensorApi::GET_SINGLE_SDR, sensor as u8),
            Self::Current(sensor) => (SensorRepo::CURRENT, SensorApi::GET_SINGLE_SDR, sensor as u8),
            Self::TotalPower => (
                SensorRepo::TOTAL_POWER,
                SensorApi::GET_SINGLE_SDR,
                TOTAL_POWER_SENSOR_ID,
            ),
            Self::AllInstances(repo) => match repo {
                SensorRepo::TEMPERATURE
                | SensorRepo::VOLTAGE
                | SensorRepo::CURRENT
                | SensorRepo::POWER => (repo, SensorApi::ALL_SDR, ALL_SENSOR_ID),
                _ => return Err(AmcError::InvalidParameter("repository has no instances")),
            },
            Self::Sdr(repo) => (sdr_repo(repo)?, SensorApi::GET_SDR, ALL_SENSOR_ID),
            Self::SdrSize(repo) => (sdr_repo(repo)?, SensorApi::GET_SIZE, ALL_SENSOR_ID),
        };

        Ok(SensorSelector::new()
            .with_sid(repo.0)
            .with_aid(api.0)
            .with_sensor_id(sensor_id))
    }
}

fn sdr_repo(repo: SensorRepo) -> Result<SensorRepo, AmcError> {
    match repo {
        SensorRepo::BOARD_INFO
        | SensorRepo::TEMPERATURE
        | SensorRepo::VOLTAGE
        | SensorRepo::CURRENT
        | SensorRepo::POWER
        | SensorRepo::TOTAL_POWER
        | SensorRepo::FPT => Ok(repo),
        _ => Err(AmcError::InvalidParameter("repository has no sensor data record")),
    }
}
